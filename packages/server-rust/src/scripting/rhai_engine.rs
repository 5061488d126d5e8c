//! Rhai handler scripts.
//!
//! Scripts see the bridge as a `host` variable:
//!
//! ```rhai
//! let id = host.property("default.id");
//! let reply = host.send_request(`<GetOrder xmlns="urn:orders"><id>${id}</id></GetOrder>`);
//! host.add_response(reply);
//!
//! let note = host.create_message(`<OrderSeen xmlns="urn:audit"/>`);
//! note.add(`<id>${id}</id>`);
//! host.post_message(note);
//! ```
//!
//! `print` output is captured and the value of the last expression is the
//! script's return value.

use std::cell::RefCell;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope, AST};
use scriptgate_core::Fragment;

use super::bridge::{BridgeError, ExecutionBridge, PendingSend, SharedBridge};
use super::ScriptOutput;

type HostResult<T> = Result<T, Box<EvalAltResult>>;

/// Shared by every script; host functions are registered once.
static ENGINE: LazyLock<Engine> = LazyLock::new(host_engine);

thread_local! {
    /// Output of `print` for the script running on this thread.
    static PRINTED: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Why a script run failed.
#[derive(Debug)]
pub enum RhaiFailure {
    /// A bridge call failed and the script did not recover.
    Bridge(BridgeError),
    /// The script itself failed.
    Script(String),
}

/// A compiled Rhai script.
#[derive(Debug)]
pub struct RhaiScript {
    ast: AST,
}

impl RhaiScript {
    /// # Errors
    ///
    /// Returns the parser's message on a syntax error.
    pub fn compile(source: &str) -> Result<Self, String> {
        let ast = ENGINE.compile(source).map_err(|e| e.to_string())?;
        Ok(Self { ast })
    }

    /// Runs the script with `host` bound to `bridge`.
    ///
    /// A failed bridge call the script did not catch is reported as
    /// [`RhaiFailure::Bridge`] with its original error.
    ///
    /// # Errors
    ///
    /// See [`RhaiFailure`].
    pub fn execute(&self, bridge: &SharedBridge) -> Result<ScriptOutput, RhaiFailure> {
        PRINTED.with_borrow_mut(String::clear);

        let mut scope = Scope::new();
        scope.push("host", HostHandle(Arc::clone(bridge)));
        let result = ENGINE.eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast);
        let failure = bridge.lock().take_failure();
        let printed = PRINTED.with_borrow_mut(std::mem::take);

        match result {
            Ok(value) => {
                if let Some(failure) = failure {
                    tracing::debug!(error = %failure, "script recovered from a failed host call");
                }
                Ok(ScriptOutput {
                    returned: returned_text(value),
                    printed,
                })
            }
            Err(err) => Err(match failure {
                Some(failure) => RhaiFailure::Bridge(failure),
                None => RhaiFailure::Script(err.to_string()),
            }),
        }
    }
}

fn returned_text(value: Dynamic) -> Option<String> {
    if value.is_unit() {
        None
    } else if value.is_string() {
        value.into_string().ok()
    } else {
        Some(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Host object
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct HostHandle(SharedBridge);

impl HostHandle {
    /// Runs a bridge call under the lock; a failure is kept on the bridge and
    /// surfaces in the script as a runtime error.
    fn call<T>(&self, f: impl FnOnce(&mut ExecutionBridge) -> Result<T, BridgeError>) -> HostResult<T> {
        let result = f(&mut *self.0.lock());
        result.map_err(|err| self.fail(err))
    }

    /// Sends outside the lock so the bridge stays usable while the call blocks.
    fn send<T>(
        &self,
        prepare: impl FnOnce(&ExecutionBridge) -> Result<PendingSend, BridgeError>,
        send: impl FnOnce(PendingSend) -> Result<T, BridgeError>,
    ) -> HostResult<T> {
        let prepared = prepare(&self.0.lock());
        let pending = prepared.map_err(|err| self.fail(err))?;
        send(pending).map_err(|err| self.fail(err))
    }

    fn fail(&self, err: BridgeError) -> Box<EvalAltResult> {
        let message = err.to_string();
        self.0.lock().record_failure(err);
        EvalAltResult::ErrorRuntime(message.into(), Position::NONE).into()
    }
}

/// An outbound message under construction, `Message` in scripts.
#[derive(Clone)]
struct MessageHandle(Fragment);

fn xml_error(err: impl std::fmt::Display) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(format!("invalid XML: {err}").into(), Position::NONE).into()
}

fn millis(delay: i64) -> Duration {
    Duration::from_millis(u64::try_from(delay).unwrap_or(0))
}

fn optional(value: &str) -> Option<&str> {
    Some(value).filter(|v| !v.is_empty())
}

fn host_engine() -> Engine {
    let mut engine = Engine::new();
    engine.on_print(|text| {
        PRINTED.with_borrow_mut(|out| {
            out.push_str(text);
            out.push('\n');
        });
    });
    engine.register_type_with_name::<HostHandle>("Host");
    engine.register_type_with_name::<MessageHandle>("Message");

    engine
        .register_fn("request", |host: &mut HostHandle| host.0.lock().request_xml())
        .register_fn("request_user", |host: &mut HostHandle| {
            host.0.lock().request_user().unwrap_or_default().to_string()
        })
        .register_fn("property", |host: &mut HostHandle, name: &str| {
            host.0
                .lock()
                .custom_property(name)
                .map_or(Dynamic::UNIT, Dynamic::from)
        });

    engine
        .register_fn("add_response", |host: &mut HostHandle, xml: &str| {
            host.call(|b| b.add_response(xml))
        })
        .register_fn("add_response_children", |host: &mut HostHandle, xml: &str| {
            host.call(|b| b.add_response_children(xml))
        })
        .register_fn("set_response", |host: &mut HostHandle, xml: &str| {
            host.call(|b| b.set_response(xml))
        })
        .register_fn("set_response_message", |host: &mut HostHandle, message: MessageHandle| {
            host.0.lock().set_response_fragment(message.0);
        })
        .register_fn("set_response_name", |host: &mut HostHandle, name: &str| {
            host.0.lock().set_response_name(name);
        })
        .register_fn("set_response_namespace", |host: &mut HostHandle, ns: &str| {
            host.0.lock().set_response_namespace(ns);
        });

    engine
        .register_fn("create_message", |host: &mut HostHandle, xml: &str| {
            host.call(|b| b.create_message(xml, None).map(MessageHandle))
        })
        .register_fn("create_message", |host: &mut HostHandle, xml: &str, user: &str| {
            host.call(|b| b.create_message(xml, optional(user)).map(MessageHandle))
        })
        .register_fn("add", |message: &mut MessageHandle, xml: &str| {
            message.0.append_method_xml(xml, false).map_err(xml_error)
        })
        .register_fn("add_children", |message: &mut MessageHandle, xml: &str| {
            message.0.append_method_xml(xml, true).map_err(xml_error)
        })
        .register_fn("set_header", |message: &mut MessageHandle, xml: &str| {
            message.0.set_header_xml(xml).map_err(xml_error)
        })
        .register_fn("strip_child_namespaces", |message: &mut MessageHandle| {
            message.0.remove_child_element_namespaces(&[]);
        })
        .register_fn("xml", |message: &mut MessageHandle| {
            message.0.method_xml().unwrap_or_default()
        })
        .register_fn("header_xml", |message: &mut MessageHandle| {
            message.0.header_xml().unwrap_or_default()
        });

    engine
        .register_fn("send_request", |host: &mut HostHandle, xml: &str| {
            host.send(|b| b.create_message(xml, None).map(|m| b.prepare_send(m)), wait_xml)
        })
        .register_fn("send_request", |host: &mut HostHandle, xml: &str, user: &str| {
            host.send(
                |b| b.create_message(xml, optional(user)).map(|m| b.prepare_send(m)),
                wait_xml,
            )
        })
        .register_fn("post_request", |host: &mut HostHandle, xml: &str| {
            host.send(|b| b.create_message(xml, None).map(|m| b.prepare_send(m)), PendingSend::post)
        })
        .register_fn("send_message", |host: &mut HostHandle, message: MessageHandle| {
            host.send(|b| Ok(b.prepare_send(message.0)), |p| p.wait().map(MessageHandle))
        })
        .register_fn("post_message", |host: &mut HostHandle, message: MessageHandle| {
            host.send(|b| Ok(b.prepare_send(message.0)), PendingSend::post)
        })
        .register_fn("schedule_request", |host: &mut HostHandle, xml: &str, delay: i64| {
            host.call(|b| b.schedule_request(xml, None, millis(delay)))
        })
        .register_fn(
            "schedule_request",
            |host: &mut HostHandle,
             xml: &str,
             user: &str,
             delay: i64,
             id: &str,
             save_request: bool,
             save_response: bool| {
                host.call(|b| {
                    b.schedule_request_with(
                        xml,
                        optional(user),
                        millis(delay),
                        optional(id).map(str::to_string),
                        save_request,
                        save_response,
                    )
                })
            },
        )
        .register_fn("save_transaction", |host: &mut HostHandle, id: &str| {
            host.call(|b| b.save_transaction(id))
        });

    engine
        .register_fn("fault", |host: &mut HostHandle, code: &str, message: &str| {
            host.call::<()>(|_| Err(ExecutionBridge::fault(code, None, message, None)))
        })
        .register_fn(
            "fault",
            |host: &mut HostHandle, code: &str, actor: &str, message: &str, detail: &str| {
                host.call::<()>(|_| {
                    Err(ExecutionBridge::fault(code, Some(actor), message, Some(detail)))
                })
            },
        );

    engine
}

fn wait_xml(pending: PendingSend) -> Result<String, BridgeError> {
    Ok(pending.wait()?.method_xml().unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::bridge::tests::{context, request, runtime};
    use crate::service::outbound::OutboundError;
    use crate::test_support::ScriptedTransport;

    fn run(source: &str) -> (Result<ScriptOutput, RhaiFailure>, SharedBridge) {
        let rt = runtime();
        let bridge = ExecutionBridge::new(
            context(&rt, ScriptedTransport::echo(), None),
            request("<Echo xmlns=\"urn:e\"><v>7</v></Echo>"),
        )
        .into_shared();
        let script = RhaiScript::compile(source).unwrap();
        let result = script.execute(&bridge);
        (result, bridge)
    }

    #[test]
    fn explicit_responses_mark_the_bridge() {
        let (result, bridge) = run(r#"
            host.add_response("<a/>");
            host.add_response("<b/>");
            "<ignored><x/></ignored>"
        "#);
        let output = result.unwrap();
        assert_eq!(output.returned.as_deref(), Some("<ignored><x/></ignored>"));

        let mut bridge = bridge.lock();
        assert!(bridge.response_set());
        bridge.resolve_response(&output).unwrap();
        let method = bridge.response().method().unwrap();
        let names: Vec<_> = method.elements().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn last_value_and_print_are_captured() {
        let (result, _) = run(r#"
            print("<p><q/></p>");
            let v = host.request();
            `<r>${v}</r>`
        "#);
        let output = result.unwrap();
        assert_eq!(output.printed, "<p><q/></p>\n");
        assert_eq!(
            output.returned.as_deref(),
            Some("<r><Echo xmlns=\"urn:e\"><v>7</v></Echo></r>")
        );
    }

    #[test]
    fn unit_result_is_no_return_value() {
        let (result, _) = run(r#"let x = host.request_user(); print(x);"#);
        let output = result.unwrap();
        assert_eq!(output.returned, None);
        assert_eq!(output.printed, "cn=alice\n");
    }

    #[test]
    fn missing_property_is_unit() {
        let (result, _) = run(r#"type_of(host.property("absent")) == "()""#);
        assert_eq!(result.unwrap().returned.as_deref(), Some("true"));
    }

    #[test]
    fn fault_surfaces_as_bridge_failure() {
        let (result, _) = run(r#"host.fault("Client.Bad", "me", "nope", "<why/>"); 1"#);
        match result {
            Err(RhaiFailure::Bridge(BridgeError::Fault(fault))) => {
                assert_eq!(fault.code, "Client.Bad");
                assert_eq!(fault.actor.as_deref(), Some("me"));
                assert_eq!(fault.detail.as_deref(), Some("<why/>"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn caught_bridge_failure_is_recovered() {
        let (result, bridge) = run(r#"
            try { host.add_response("<broken>"); } catch (e) { print(e); }
            "<r><ok/></r>"
        "#);
        let output = result.unwrap();
        assert!(output.printed.contains("invalid XML"));
        assert!(bridge.lock().take_failure().is_none());
        assert!(!bridge.lock().response_set());
    }

    #[test]
    fn script_errors_are_reported() {
        let (result, _) = run(r#"throw "boom""#);
        assert!(matches!(result, Err(RhaiFailure::Script(msg)) if msg.contains("boom")));
    }

    #[test]
    fn built_messages_are_posted_and_used_as_response() {
        let rt = runtime();
        let transport = ScriptedTransport::echo();
        let bridge = ExecutionBridge::new(
            context(&rt, transport.clone(), None),
            request("<Echo xmlns=\"urn:e\"/>"),
        )
        .into_shared();
        let script = RhaiScript::compile(r#"
            let note = host.create_message(`<Seen xmlns="urn:audit"/>`, "cn=auditor");
            note.add(`<id xmlns="urn:other">4</id>`);
            note.strip_child_namespaces();
            host.post_message(note);

            let order = host.create_message(`<GetOrder xmlns="urn:orders"/>`);
            let reply = host.send_message(order);
            reply.add("<checked/>");
            host.set_response_message(reply);
        "#)
        .unwrap();

        script.execute(&bridge).unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].user_dn.as_deref(), Some("cn=auditor"));
        let note = sent[0].envelope.method().unwrap();
        assert_eq!(note.name(), "Seen");
        assert_eq!(note.child("id").unwrap().to_xml(), "<id>4</id>");
        assert_eq!(sent[1].user_dn.as_deref(), Some("cn=alice"));

        let mut bridge = bridge.lock();
        assert!(bridge.response_set());
        let parts = bridge.take_parts();
        let method = parts.response.method().unwrap();
        assert_eq!(method.name(), "GetOrder");
        assert!(method.child("checked").is_some());
    }

    #[test]
    fn bridge_is_usable_while_a_send_blocks() {
        let rt = runtime();
        let bridge_slot: Arc<parking_lot::Mutex<Option<SharedBridge>>> = Arc::default();
        let seen = Arc::clone(&bridge_slot);
        let transport = ScriptedTransport::replying(move |req| {
            let bridge = seen.lock().clone().unwrap();
            assert!(bridge.try_lock().is_some(), "bridge locked during send");
            Ok(req.envelope.clone())
        });
        let bridge = ExecutionBridge::new(context(&rt, transport, None), request("<Echo/>")).into_shared();
        *bridge_slot.lock() = Some(Arc::clone(&bridge));

        let script = RhaiScript::compile(r#"host.send_request("<Ping/>")"#).unwrap();
        let output = script.execute(&bridge).unwrap();
        assert_eq!(output.returned.as_deref(), Some("<Ping/>"));
    }

    #[test]
    fn print_output_is_kept_per_run() {
        let (first, _) = run(r#"print("one");"#);
        let (second, _) = run(r#"print("two");"#);
        assert_eq!(first.unwrap().printed, "one\n");
        assert_eq!(second.unwrap().printed, "two\n");
    }

    #[test]
    fn remote_fault_from_send_request() {
        let rt = runtime();
        let transport = ScriptedTransport::replying(|_| {
            Ok(scriptgate_core::Envelope::with_method(
                scriptgate_core::Fault::new("Server.Down", "gone").to_element(Some("SOAP")),
            ))
        });
        let bridge = ExecutionBridge::new(context(&rt, transport, None), request("<Echo/>")).into_shared();
        let script = RhaiScript::compile(r#"host.send_request("<Ping/>")"#).unwrap();

        match script.execute(&bridge) {
            Err(RhaiFailure::Bridge(BridgeError::Outbound(OutboundError::RemoteFault(remote)))) => {
                assert_eq!(remote.fault.code, "Server.Down");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
