use std::io::Read;

use dbusprims_wire::{message_frame_length, unmarshal, Message, WireError};

use crate::cmd::DecodeArgs;
use crate::exit::{io_error, wire_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let raw = match &args.file {
        Some(path) => std::fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .map_err(|err| io_error("failed reading stdin", err))?;
            buf
        }
    };

    let bytes = if args.hex { decode_hex(&raw)? } else { raw };
    for message in decode_all(&bytes)? {
        print_message(&message, format);
    }
    Ok(SUCCESS)
}

fn decode_hex(text: &[u8]) -> CliResult<Vec<u8>> {
    let compact: Vec<u8> = text
        .iter()
        .copied()
        .filter(|byte| !byte.is_ascii_whitespace())
        .collect();
    hex::decode(compact).map_err(|err| CliError::new(DATA_INVALID, format!("invalid hex: {err}")))
}

/// Decode every message in a buffer of back-to-back frames.
fn decode_all(bytes: &[u8]) -> CliResult<Vec<Message>> {
    if bytes.is_empty() {
        return Err(CliError::new(DATA_INVALID, "no input"));
    }

    let mut messages = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let rest = &bytes[offset..];
        let frame_len = message_frame_length(rest).map_err(|err| truncated(offset, err))?;
        if frame_len > rest.len() {
            return Err(CliError::new(
                DATA_INVALID,
                format!(
                    "message at offset {offset} is truncated ({} of {frame_len} bytes)",
                    rest.len()
                ),
            ));
        }
        let message = unmarshal(&rest[..frame_len])
            .map_err(|err| wire_error(&format!("message at offset {offset}"), err))?;
        messages.push(message);
        offset += frame_len;
    }
    Ok(messages)
}

fn truncated(offset: usize, err: WireError) -> CliError {
    if err.is_underrun() {
        CliError::new(
            DATA_INVALID,
            format!("message at offset {offset} is truncated: {err}"),
        )
    } else {
        wire_error(&format!("message at offset {offset}"), err)
    }
}
