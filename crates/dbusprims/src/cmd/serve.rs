use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use dbusprims_peer::{Connection, ConnectionListener, HandshakeConfig, PeerError, BUS_NAME};
use dbusprims_transport::{BusAddress, BusStream, TransportError};
use dbusprims_wire::{
    Dict, Message, MessageType, Value, Variant, WireError, FLAG_NO_REPLY_EXPECTED,
};
use tracing::{debug, info, warn};

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{peer_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::OutputFormat;

const TEST_PATH: &str = "/org/test/Server";
const TEST_INTERFACE: &str = "org.test.Server";
const TEST_ERROR: &str = "org.test.Error.TestError";
const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
const SIGNAL_COUNT: u32 = 5;

/// What to do after answering a call.
#[derive(Debug)]
enum Response {
    Reply(Message),
    /// Reply, then stream the `Counter` signals.
    ReplyThenSignals(Message),
}

pub fn run(args: ServeArgs, _format: OutputFormat) -> CliResult<i32> {
    let interval = parse_duration(&args.signal_interval)?;
    let handshake_config = HandshakeConfig {
        server_guid: args.guid.clone(),
        ..HandshakeConfig::default()
    };

    let mut listener = ConnectionListener::bind(&args.address)
        .map_err(|err| peer_error("bind failed", err))?
        .with_handshake_config(handshake_config);
    if args.no_auth {
        listener = listener.without_auth();
    }

    let address = listener.address().clone();
    info!(%address, auth = !args.no_auth, "serving");
    // The resolved address (TCP port 0 included) goes to stdout for scripts.
    println!("{address}");
    let _ = std::io::stdout().flush();

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone(), address)?;

    while running.load(Ordering::SeqCst) {
        let conn = match listener.accept() {
            Ok(conn) => conn,
            Err(err @ PeerError::Transport(TransportError::Accept(_))) => {
                return Err(peer_error("accept failed", err));
            }
            Err(err) => {
                if running.load(Ordering::SeqCst) {
                    warn!(error = %err, "client handshake failed");
                }
                continue;
            }
        };
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let name = conn.unique_name().unwrap_or(":1.?").to_string();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || serve_connection(conn, interval));
        if let Err(err) = spawned {
            warn!(unique_name = %name, error = %err, "failed to spawn connection thread");
        }
    }

    info!("shutting down");
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>, address: BusAddress) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
        // Unblock accept(); the throwaway stream closes before any handshake.
        let _ = BusStream::connect(&address);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

fn serve_connection(mut conn: Connection, interval: Duration) {
    let unique_name = conn.unique_name().unwrap_or_default().to_string();
    loop {
        let call = match conn.recv() {
            Ok(message) => message,
            Err(PeerError::Disconnected(_)) => {
                info!(unique_name = %unique_name, "client disconnected");
                return;
            }
            Err(err) => {
                warn!(unique_name = %unique_name, error = %err, "receive failed");
                return;
            }
        };
        if call.message_type != MessageType::MethodCall {
            debug!(unique_name = %unique_name, message_type = call.message_type.name(), "ignoring");
            continue;
        }
        info!(
            unique_name = %unique_name,
            interface = call.interface.as_deref().unwrap_or(""),
            member = call.member.as_deref().unwrap_or(""),
            serial = call.serial,
            signature = call.signature().as_str(),
            "call"
        );

        let response = match dispatch(&call, &unique_name) {
            Ok(response) => response,
            Err(err) => {
                warn!(unique_name = %unique_name, error = %err, "failed to build reply");
                continue;
            }
        };
        let wants_reply = !call.no_reply_expected();
        let result = match response {
            Response::Reply(reply) if wants_reply => conn.send(reply).map(|_| ()),
            Response::ReplyThenSignals(reply) => {
                let sent = if wants_reply {
                    conn.send(reply).map(|_| ())
                } else {
                    Ok(())
                };
                sent.and_then(|()| send_counter_signals(&mut conn, &unique_name, interval))
            }
            Response::Reply(_) => Ok(()),
        };
        if let Err(err) = result {
            warn!(unique_name = %unique_name, error = %err, "send failed");
            return;
        }
    }
}

#[allow(clippy::approx_constant)]
fn dispatch(call: &Message, unique_name: &str) -> Result<Response, WireError> {
    let member = call.member.as_deref().unwrap_or_default();
    let reply = || reply_to(call, unique_name);

    let message = match member {
        "Hello" => reply()
            .with_sender(BUS_NAME)
            .with_body("s", vec![Value::from(unique_name)])?,
        "AddMatch" => reply().with_sender(BUS_NAME),
        "EchoString" => {
            let text = call.body().first().and_then(Value::as_str).unwrap_or_default();
            reply().with_body("s", vec![Value::from(text)])?
        }
        "EchoMultiple" => reply().with_body(call.signature().as_str(), call.body().to_vec())?,
        "GetBasicTypes" => reply().with_body(
            "ybnqiuds",
            vec![
                Value::Byte(255),
                Value::Boolean(true),
                Value::Int16(-1234),
                Value::UInt16(65000),
                Value::Int32(-100_000),
                Value::UInt32(100_000),
                Value::Double(3.14159265),
                Value::from("hello from server"),
            ],
        )?,
        "GetArray" => reply().with_body("ai", vec![Value::array([10i32, 20, 30, 40, 50])])?,
        "GetDict" => {
            let dict: Dict = [("alpha", 1u32), ("beta", 2), ("gamma", 3)]
                .into_iter()
                .collect();
            reply().with_body("a{su}", vec![Value::Dict(dict)])?
        }
        "GetStruct" => reply().with_body(
            "(siu)",
            vec![Value::structure([
                Value::from("structval"),
                Value::Int32(-42),
                Value::UInt32(999),
            ])],
        )?,
        "GetNested" => {
            let dict: Dict = [
                ("primes", Value::array([2i32, 3, 5, 7, 11])),
                ("evens", Value::array([2i32, 4, 6, 8, 10])),
            ]
            .into_iter()
            .collect();
            reply().with_body("a{sai}", vec![Value::Dict(dict)])?
        }
        "GetVariant" => reply().with_body(
            "v",
            vec![Value::from(Variant::new("s", Value::from("variant-value"))?)],
        )?,
        "GetVariantDict" => {
            let features = Value::array(["websocket", "browser", "marshall"]);
            let dict: Dict = [
                ("name", Variant::new("s", Value::from("dbus-next"))?),
                ("version", Variant::new("u", Value::UInt32(1))?),
                ("features", Variant::new("as", features)?),
            ]
            .into_iter()
            .collect();
            reply().with_body("a{sv}", vec![Value::Dict(dict)])?
        }
        "SendAndVerify" => {
            let ok = body_shape_matches(call.body());
            let text = if ok {
                "all types received correctly"
            } else {
                "type mismatch"
            };
            reply().with_body("sb", vec![Value::from(text), Value::Boolean(ok)])?
        }
        "TriggerError" => error_to(
            call,
            unique_name,
            TEST_ERROR,
            "This is a test error from the server",
        )?,
        "GetServerTime" => {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            reply().with_body("s", vec![Value::from(now)])?
        }
        "SubscribeSignals" => return Ok(Response::ReplyThenSignals(reply())),
        other => error_to(
            call,
            unique_name,
            UNKNOWN_METHOD,
            &format!("No such method '{other}'"),
        )?,
    };
    Ok(Response::Reply(message))
}

fn reply_to(call: &Message, unique_name: &str) -> Message {
    let mut reply = Message::method_return(call)
        .with_flags(FLAG_NO_REPLY_EXPECTED)
        .with_destination(unique_name);
    reply.sender = call.destination.clone();
    reply
}

fn error_to(call: &Message, unique_name: &str, name: &str, text: &str) -> Result<Message, WireError> {
    let mut error = Message::error(call, name, text)?
        .with_flags(FLAG_NO_REPLY_EXPECTED)
        .with_destination(unique_name);
    error.sender = call.destination.clone();
    Ok(error)
}

/// A string, a number, an array and a boolean, in that order.
fn body_shape_matches(body: &[Value]) -> bool {
    matches!(
        body,
        [
            Value::String(_),
            Value::Byte(_)
                | Value::Int16(_)
                | Value::UInt16(_)
                | Value::Int32(_)
                | Value::UInt32(_)
                | Value::Int64(_)
                | Value::UInt64(_)
                | Value::Double(_),
            Value::Array(_),
            Value::Boolean(_),
        ]
    )
}

fn counter_signal(n: u32, unique_name: &str) -> Result<Message, WireError> {
    Message::signal(TEST_PATH, TEST_INTERFACE, "Counter")?
        .with_sender(TEST_INTERFACE)
        .with_destination(unique_name)
        .with_flags(FLAG_NO_REPLY_EXPECTED)
        .with_body(
            "us",
            vec![
                Value::UInt32(n),
                Value::from(format!("signal {n} of {SIGNAL_COUNT}")),
            ],
        )
}

fn done_signal(count: u32, unique_name: &str) -> Result<Message, WireError> {
    Message::signal(TEST_PATH, TEST_INTERFACE, "SignalsDone")?
        .with_sender(TEST_INTERFACE)
        .with_destination(unique_name)
        .with_flags(FLAG_NO_REPLY_EXPECTED)
        .with_body("u", vec![Value::UInt32(count)])
}

fn send_counter_signals(
    conn: &mut Connection,
    unique_name: &str,
    interval: Duration,
) -> Result<(), PeerError> {
    for n in 1..=SIGNAL_COUNT {
        thread::sleep(interval);
        conn.send(counter_signal(n, unique_name)?)?;
    }
    thread::sleep(interval);
    conn.send(done_signal(SIGNAL_COUNT, unique_name)?)?;
    debug!(unique_name = %unique_name, count = SIGNAL_COUNT, "signals sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use dbusprims_wire::{marshal, unmarshal, Endianness};

    use super::*;

    fn call(member: &str) -> Message {
        Message::method_call(TEST_PATH, member)
            .unwrap()
            .with_interface(TEST_INTERFACE)
            .with_destination(TEST_INTERFACE)
            .with_serial(7)
    }

    fn reply_for(call: &Message) -> Message {
        match dispatch(call, ":1.3").unwrap() {
            Response::Reply(message) | Response::ReplyThenSignals(message) => message,
        }
    }

    #[test]
    fn hello_returns_unique_name_from_the_bus() {
        let reply = reply_for(&call("Hello"));
        assert_eq!(reply.message_type, MessageType::MethodReturn);
        assert_eq!(reply.reply_serial, Some(7));
        assert_eq!(reply.sender.as_deref(), Some(BUS_NAME));
        assert_eq!(reply.destination.as_deref(), Some(":1.3"));
        assert_eq!(reply.body(), &[Value::from(":1.3")]);
    }

    #[test]
    fn basic_types_survive_the_wire() {
        let mut reply = reply_for(&call("GetBasicTypes"));
        reply.serial = 1;
        assert_eq!(reply.signature().as_str(), "ybnqiuds");
        let decoded = unmarshal(&marshal(&reply, Endianness::Big).unwrap()).unwrap();
        assert_eq!(decoded.body(), reply.body());
        assert_eq!(decoded.body()[7].as_str(), Some("hello from server"));
    }

    #[test]
    fn canned_signatures() {
        let cases = [
            ("GetArray", "ai"),
            ("GetDict", "a{su}"),
            ("GetStruct", "(siu)"),
            ("GetNested", "a{sai}"),
            ("GetVariant", "v"),
            ("GetVariantDict", "a{sv}"),
            ("GetServerTime", "s"),
            ("AddMatch", ""),
        ];
        for (member, signature) in cases {
            let reply = reply_for(&call(member));
            assert_eq!(reply.signature().as_str(), signature, "{member}");
            assert!(reply.sender.is_some(), "{member}");
        }
    }

    #[test]
    fn variant_dict_contents() {
        let reply = reply_for(&call("GetVariantDict"));
        let dict = reply.body()[0].as_dict().unwrap();
        let name = dict.get_str("name").and_then(Value::as_variant).unwrap();
        assert_eq!(name.value().as_str(), Some("dbus-next"));
        let features = dict.get_str("features").and_then(Value::as_variant).unwrap();
        assert_eq!(features.signature().as_str(), "as");
        assert_eq!(features.value().as_slice().map(<[Value]>::len), Some(3));
    }

    #[test]
    fn echo_multiple_mirrors_the_body() {
        let echo = call("EchoMultiple")
            .with_body("sub", vec![Value::from("x"), Value::UInt32(3), Value::Boolean(false)])
            .unwrap();
        let reply = reply_for(&echo);
        assert_eq!(reply.signature().as_str(), "sub");
        assert_eq!(reply.body(), echo.body());
    }

    #[test]
    fn send_and_verify_checks_shape() {
        let good = call("SendAndVerify")
            .with_body(
                "sdaib",
                vec![
                    Value::from("s"),
                    Value::Double(1.5),
                    Value::array([1i32]),
                    Value::Boolean(true),
                ],
            )
            .unwrap();
        assert_eq!(reply_for(&good).body()[1], Value::Boolean(true));

        let bad = call("SendAndVerify")
            .with_body("s", vec![Value::from("only one")])
            .unwrap();
        let reply = reply_for(&bad);
        assert_eq!(reply.body()[0].as_str(), Some("type mismatch"));
        assert_eq!(reply.body()[1], Value::Boolean(false));
    }

    #[test]
    fn trigger_error_and_unknown_methods() {
        let reply = reply_for(&call("TriggerError"));
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(reply.error_name.as_deref(), Some(TEST_ERROR));
        assert_eq!(
            reply.error_text(),
            Some("This is a test error from the server")
        );

        let reply = reply_for(&call("Nope"));
        assert_eq!(reply.error_name.as_deref(), Some(UNKNOWN_METHOD));
    }

    #[test]
    fn subscribe_requests_signals() {
        assert!(matches!(
            dispatch(&call("SubscribeSignals"), ":1.3").unwrap(),
            Response::ReplyThenSignals(_)
        ));
        let signal = counter_signal(2, ":1.3").unwrap();
        assert_eq!(signal.body()[1].as_str(), Some("signal 2 of 5"));
        assert_eq!(done_signal(5, ":1.3").unwrap().body(), &[Value::UInt32(5)]);
    }
}
