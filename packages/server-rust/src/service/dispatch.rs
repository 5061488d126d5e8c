//! The dispatcher: turns one inbound request into exactly one response or
//! fault.
//!
//! A request moves through [`DispatchState`]s:
//!
//! 1. **Resolving** finds the handler and pre-processor from one registry
//!    snapshot, reloading definitions first if they changed.
//! 2. **PreProcessing** runs the pre-processor, which may stop the request
//!    after writing its own response.
//! 3. **Executing** runs the handler on a blocking thread against an
//!    [`ExecutionBridge`] and falls back to its implicit output.
//! 4. **Assembling** merges the handler's response into the response envelope
//!    and renames the response element, or builds the fault response.
//!
//! Operations whose implementation names a built-in action skip the handler
//! and are served from the transaction store.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use scriptgate_core::{Element, Envelope, Fault, Fragment, Locator};
use tokio::runtime::Handle;
use tower::Service;

use super::config::{ConfigError, ConnectorConfig};
use super::context::ConnectorContext;
use super::interface::InterfaceCache;
use super::internal::BuiltinMethod;
use super::operation::{
    DispatchError, DispatchOutcome, DispatchState, InboundRequest, OutcomeKind,
};
use super::outbound::OutboundError;
use super::preprocessor::{PreProcessInvocation, PreProcessorFactory};
use super::registry::{HandlerRegistry, Resolution};
use crate::scripting::{BridgeError, ExecutionBridge, ResponseParts, ScriptError};
use crate::storage::transactions::TransactionKind;
use crate::traits::{InterfaceSource, Transport};

/// Fault code for failures that are neither remote nor raised by a handler.
pub const SERVER_EXCEPTION: &str = "Server.Exception";

/// Tracks the current stage of one request for logging.
#[derive(Debug)]
struct Progress {
    call_id: u64,
    state: DispatchState,
}

impl Progress {
    fn new(call_id: u64) -> Self {
        Self {
            call_id,
            state: DispatchState::Resolving,
        }
    }

    fn advance(&mut self, next: DispatchState) {
        tracing::debug!(call_id = self.call_id, from = self.state.as_str(), to = next.as_str(), "dispatch state");
        self.state = next;
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes requests to handlers and builds their responses.
///
/// Cheap to clone; every clone shares the same registry and context.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    context: Arc<ConnectorContext>,
    registry: Arc<HandlerRegistry>,
    interfaces: Arc<InterfaceCache>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        context: Arc<ConnectorContext>,
        registry: Arc<HandlerRegistry>,
        interfaces: Arc<InterfaceCache>,
    ) -> Self {
        Self {
            context,
            registry,
            interfaces,
        }
    }

    /// Wires a dispatcher from configuration.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] met while loading definitions or
    /// custom properties.
    pub fn from_config(
        config: ConnectorConfig,
        transport: Arc<dyn Transport>,
        interfaces: Arc<dyn InterfaceSource>,
        factory: PreProcessorFactory,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        let registry = HandlerRegistry::load(
            config.definition_file.clone(),
            config.reload_check_interval,
            factory,
        )?;
        let context = ConnectorContext::new(config, transport, runtime)?;
        Ok(Self::new(
            Arc::new(context),
            Arc::new(registry),
            Arc::new(InterfaceCache::new(interfaces)),
        ))
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ConnectorContext> {
        &self.context
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Handles one request. Failures become fault responses.
    pub async fn dispatch(&self, request: InboundRequest) -> DispatchOutcome {
        let call_id = request.call_id;
        let mut progress = Progress::new(call_id);
        let mut transaction_id = None;

        self.context.properties.refresh();

        let (kind, envelope) = match self.process(&request, &mut progress, &mut transaction_id).await {
            Ok(done) => done,
            Err(err) => {
                tracing::error!(
                    call_id,
                    operation = request.operation(),
                    state = progress.state.as_str(),
                    category = ?err.category(),
                    error = %err,
                    "request failed; returning fault"
                );
                progress.advance(DispatchState::Assembling);
                (OutcomeKind::Fault, fault_response(&request.envelope, &err))
            }
        };

        if let Some(id) = transaction_id {
            self.save_response(&id, &envelope).await;
        }
        progress.advance(DispatchState::Done);
        tracing::trace!(call_id, response = %envelope.to_xml(), "sending response");

        DispatchOutcome {
            call_id,
            kind,
            envelope,
        }
    }

    async fn process(
        &self,
        request: &InboundRequest,
        progress: &mut Progress,
        transaction_id: &mut Option<String>,
    ) -> Result<(OutcomeKind, Envelope), DispatchError> {
        if request.envelope.method().is_none() {
            return Err(DispatchError::MissingMethod);
        }
        let operation = request.operation().to_string();
        let namespace = request.namespace().to_string();

        if let Some(builtin) = BuiltinMethod::from_implementation(request.metadata.implementation.as_deref()) {
            tracing::debug!(call_id = request.call_id, action = builtin.action(), "serving built-in method");
            progress.advance(DispatchState::Executing);
            let envelope = self.serve_builtin(builtin, request).await?;
            progress.advance(DispatchState::Assembling);
            return Ok((OutcomeKind::Response, envelope));
        }

        let registry = Arc::clone(&self.registry);
        let (op, ns) = (operation.clone(), namespace.clone());
        let resolution = blocking(move || Ok(registry.resolve(&op, &ns)?))
            .await?
            .ok_or_else(|| DispatchError::NoHandler(Locator::exact(&operation, &namespace)))?;
        tracing::debug!(
            call_id = request.call_id,
            handler = %resolution.handler.locator(),
            script = %resolution.handler.script_path().display(),
            "resolved handler"
        );

        let mut response = Envelope::response_to(&request.envelope);

        if resolution.preprocessor.is_some() {
            progress.advance(DispatchState::PreProcessing);
            let (proceed, written) = preprocess(&resolution, request, response).await?;
            response = written;
            if !proceed {
                tracing::debug!(call_id = request.call_id, "pre-processor stopped the request");
                return Ok((OutcomeKind::ShortCircuited, response));
            }
        }

        progress.advance(DispatchState::Executing);
        let mut parts = self.execute(&resolution, request, transaction_id).await?;

        progress.advance(DispatchState::Assembling);
        parts.response.write_to(&mut response, false);
        self.rename_response(&mut response, &parts, request).await;
        Ok((OutcomeKind::Response, response))
    }

    /// Runs the handler and returns what it built. The transaction id is
    /// handed back even when the handler failed.
    async fn execute(
        &self,
        resolution: &Resolution,
        request: &InboundRequest,
        transaction_id: &mut Option<String>,
    ) -> Result<ResponseParts, DispatchError> {
        let mut source = request.envelope.clone();
        let mut fragment = Fragment::new();
        fragment.read_from(&mut source);
        fragment.set_user_dn(request.metadata.user_dn.clone());
        fragment.set_organization_dn(request.metadata.organization_dn.clone());

        let bridge = ExecutionBridge::new(Arc::clone(&self.context), fragment).into_shared();
        let handler = Arc::clone(&resolution.handler);
        let shared = Arc::clone(&bridge);
        let executed = blocking(move || {
            let output = handler.execute(&shared)?;
            shared.lock().resolve_response(&output)?;
            Ok(())
        })
        .await;

        let parts = bridge.lock().take_parts();
        transaction_id.clone_from(&parts.transaction_id);
        executed.map(|()| parts)
    }

    async fn serve_builtin(
        &self,
        builtin: BuiltinMethod,
        request: &InboundRequest,
    ) -> Result<Envelope, DispatchError> {
        let store = self.context.transactions.clone();
        let envelope = request.envelope.clone();
        blocking(move || {
            let mut response = Envelope::response_to(&envelope);
            let method = envelope.method().ok_or(DispatchError::MissingMethod)?;
            let target = response.method_mut().ok_or(DispatchError::MissingMethod)?;
            builtin.execute(store.as_deref(), method, target)?;
            Ok(response)
        })
        .await
    }

    /// Applies the handler's name and namespace override, falling back to the
    /// response element named by the interface description.
    async fn rename_response(&self, response: &mut Envelope, parts: &ResponseParts, request: &InboundRequest) {
        if response.method().is_none() {
            return;
        }
        let discovered = if parts.name.is_none() || parts.namespace.is_none() {
            let metadata = &request.metadata;
            self.interfaces
                .response_element(
                    metadata.method_dn.as_deref(),
                    metadata.interface.as_deref(),
                    request.operation(),
                    Some(request.namespace()).filter(|ns| !ns.is_empty()),
                )
                .await
        } else {
            None
        };

        let name = parts
            .name
            .clone()
            .or_else(|| discovered.as_ref().map(|d| d.name.clone()));
        let namespace = parts
            .namespace
            .clone()
            .or_else(|| discovered.and_then(|d| d.namespace));

        let Some(method) = response.method_mut() else {
            return;
        };
        let prefix = method.prefix().map(str::to_string);
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            method.set_name(match &prefix {
                Some(prefix) => format!("{prefix}:{name}"),
                None => name,
            });
        }
        if let Some(namespace) = namespace.filter(|ns| !ns.is_empty()) {
            let declaration = match &prefix {
                Some(prefix) => format!("xmlns:{prefix}"),
                None => "xmlns".to_string(),
            };
            method.set_attribute(declaration, namespace.clone());
            method.set_namespace(Some(namespace));
        }
    }

    async fn save_response(&self, id: &str, envelope: &Envelope) {
        let Some(store) = self.context.transactions.clone() else {
            tracing::error!(transaction = id, "no transaction folder configured; response not saved");
            return;
        };
        let Some(mut root) = envelope.body().and_then(Element::first_element).cloned() else {
            return;
        };
        let id = id.to_string();
        let written = tokio::task::spawn_blocking(move || store.write(&id, TransactionKind::Response, &mut root)).await;
        match written {
            Ok(Ok(sequence)) => tracing::debug!(sequence, "saved response"),
            Ok(Err(err)) => tracing::error!(error = %err, "unable to write response file"),
            Err(err) => tracing::error!(error = %err, "transaction writer panicked"),
        }
    }
}

async fn preprocess(
    resolution: &Resolution,
    request: &InboundRequest,
    mut response: Envelope,
) -> Result<(bool, Envelope), DispatchError> {
    let Some(pre) = resolution.preprocessor.clone() else {
        return Ok((true, response));
    };
    let handler = Arc::clone(&resolution.handler);
    let envelope = request.envelope.clone();
    let metadata = request.metadata.clone();

    blocking(move || {
        tracing::debug!(preprocessor = %pre.name, "running pre-processor");
        let mut invocation = PreProcessInvocation {
            locator: handler.locator(),
            script_path: handler.script_path(),
            metadata: &metadata,
            request: &envelope,
            response: &mut response,
        };
        let proceed = pre
            .instance
            .execute(&mut invocation)
            .map_err(|source| DispatchError::PreProcessor {
                name: pre.name.clone(),
                source,
            })?;
        Ok((proceed, response))
    })
    .await
}

async fn blocking<T, F>(f: F) -> Result<T, DispatchError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DispatchError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| DispatchError::Task(err.to_string()))?
}

// ---------------------------------------------------------------------------
// Fault responses
// ---------------------------------------------------------------------------

/// The fault envelope for `err`, using the request's envelope prefix.
fn fault_response(request: &Envelope, err: &DispatchError) -> Envelope {
    let prefix = request.prefix();
    let element = match err {
        DispatchError::Script(ScriptError::Bridge(BridgeError::Outbound(OutboundError::RemoteFault(remote)))) => {
            remote.element.clone()
        }
        DispatchError::Script(ScriptError::Bridge(BridgeError::Fault(raised))) => {
            let mut fault = Fault::new(raised.code.clone(), raised.message.clone());
            fault.actor.clone_from(&raised.actor);
            if let Some(detail) = &raised.detail {
                match Element::parse(detail) {
                    Ok(detail) => fault.detail = Some(detail),
                    Err(parse) => {
                        tracing::error!(error = %parse, "unable to parse the fault detail; sending fault without it");
                    }
                }
            }
            fault.to_element(prefix)
        }
        _ => server_exception(err).to_element(prefix),
    };

    let mut envelope = Envelope::with_prefix(prefix);
    envelope.with_body(|body| body.push(element));
    envelope
}

fn server_exception(err: &DispatchError) -> Fault {
    let mut trace = Element::new("trace");
    trace.set_text(error_chain(err));
    Fault::new(SERVER_EXCEPTION, err.to_string()).with_detail(trace)
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut lines = vec![format!("{err}")];
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// tower::Service
// ---------------------------------------------------------------------------

impl Service<InboundRequest> for Dispatcher {
    type Response = DispatchOutcome;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchOutcome, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: InboundRequest) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move { Ok(dispatcher.dispatch(request).await) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use scriptgate_core::{RequestMetadata, SOAP_ENVELOPE_NS};
    use tower::ServiceExt;

    use super::*;
    use crate::service::preprocessor::PreProcessor;
    use crate::storage::transactions::TransactionStore;
    use crate::test_support::{ScriptedTransport, StaticInterfaces};
    use crate::traits::NoImports;

    struct Gate;

    impl PreProcessor for Gate {
        fn initialize(&mut self, _params: &HashMap<String, String>) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn execute(&self, invocation: &mut PreProcessInvocation<'_>) -> anyhow::Result<bool> {
            let blocked = invocation
                .request
                .method()
                .and_then(|m| m.child("block"))
                .is_some();
            if blocked {
                if let Some(method) = invocation.response.method_mut() {
                    method.push(Element::new("blocked"));
                }
            }
            Ok(!blocked)
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(definitions: &str, scripts: &[(&str, &str)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("handlers.properties"), definitions).unwrap();
            for (name, text) in scripts {
                std::fs::write(dir.path().join(name), text).unwrap();
            }
            std::fs::create_dir(dir.path().join("txn")).unwrap();
            Self { dir }
        }

        fn path(&self, name: &str) -> std::path::PathBuf {
            self.dir.path().join(name)
        }

        fn dispatcher(&self, transport: Arc<dyn Transport>, interfaces: Arc<dyn InterfaceSource>) -> Dispatcher {
            let config = ConnectorConfig {
                definition_file: self.path("handlers.properties"),
                transaction_dir: Some(self.path("txn")),
                reload_check_interval: Duration::ZERO,
                ..ConnectorConfig::default()
            };
            let mut factory = PreProcessorFactory::with_builtins();
            factory.register("gate", || Box::new(Gate));
            Dispatcher::from_config(config, transport, interfaces, factory, Handle::current()).unwrap()
        }
    }

    fn inbound(method: &str) -> InboundRequest {
        let envelope = Envelope::parse(&format!(
            "<SOAP:Envelope xmlns:SOAP=\"{SOAP_ENVELOPE_NS}\"><SOAP:Body>{method}</SOAP:Body></SOAP:Envelope>"
        ))
        .unwrap();
        InboundRequest::new(
            envelope,
            RequestMetadata {
                user_dn: Some("cn=alice".into()),
                ..RequestMetadata::default()
            },
        )
    }

    fn child_names(envelope: &Envelope) -> Vec<String> {
        envelope
            .method()
            .unwrap()
            .elements()
            .map(|e| e.name().to_string())
            .collect()
    }

    fn fault_of(outcome: &DispatchOutcome) -> Fault {
        assert!(outcome.is_fault(), "expected a fault: {}", outcome.envelope.to_xml());
        Fault::from_element(outcome.envelope.method().unwrap()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn specific_handler_wins_over_wildcard() {
        let fixture = Fixture::new(
            "Echo=echo.rhai\nEcho.namespace=ns1\n*=fallback.rhai\n",
            &[
                ("echo.rhai", r#"host.add_response("<specific/>");"#),
                ("fallback.rhai", r#"host.add_response("<wildcard/>");"#),
            ],
        );
        let dispatcher = fixture.dispatcher(ScriptedTransport::echo(), Arc::new(NoImports));

        let outcome = dispatcher.dispatch(inbound("<Echo xmlns=\"ns1\"/>")).await;
        assert_eq!(outcome.kind, OutcomeKind::Response);
        assert_eq!(child_names(&outcome.envelope), vec!["specific"]);

        let other = dispatcher.dispatch(inbound("<Other xmlns=\"ns2\"/>")).await;
        assert_eq!(child_names(&other.envelope), vec!["wildcard"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn explicit_responses_keep_order_and_skip_fallback() {
        let fixture = Fixture::new(
            "Echo=echo.rhai\nEcho.namespace=ns1\n",
            &[(
                "echo.rhai",
                r#"
                    host.add_response("<a/>");
                    host.add_response("<b/>");
                    print("<printed><p/></printed>");
                    "<returned><r/></returned>"
                "#,
            )],
        );
        let dispatcher = fixture.dispatcher(ScriptedTransport::echo(), Arc::new(NoImports));

        let outcome = dispatcher.dispatch(inbound("<Echo xmlns=\"ns1\"/>")).await;
        let method = outcome.envelope.method().unwrap();
        assert_eq!(method.name(), "EchoResponse");
        assert_eq!(method.namespace(), Some("ns1"));
        assert_eq!(child_names(&outcome.envelope), vec!["a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn template_return_value_becomes_response() {
        let fixture = Fixture::new(
            "*=hello.xml\n",
            &[("hello.xml", "<r><user>{{user}}</user><id>{{request:id}}</id></r>")],
        );
        let dispatcher = fixture.dispatcher(ScriptedTransport::echo(), Arc::new(NoImports));

        let outcome = dispatcher
            .dispatch(inbound("<Hello xmlns=\"urn:h\"><id>42</id></Hello>"))
            .await;
        let method = outcome.envelope.method().unwrap();
        assert_eq!(method.child("user").unwrap().text(), "cn=alice");
        assert_eq!(method.child("id").unwrap().text(), "42");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_handler_is_a_server_fault() {
        let fixture = Fixture::new("Echo=echo.rhai\nEcho.namespace=ns1\n", &[("echo.rhai", "1")]);
        let dispatcher = fixture.dispatcher(ScriptedTransport::echo(), Arc::new(NoImports));

        let outcome = dispatcher.dispatch(inbound("<Other xmlns=\"ns1\"/>")).await;
        let fault = fault_of(&outcome);
        assert_eq!(fault.code, SERVER_EXCEPTION);
        assert!(fault.message.contains("no handler"));
        assert!(fault.detail.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_fault_keeps_code_and_detail() {
        let fixture = Fixture::new(
            "*=fail.rhai\n",
            &[(
                "fail.rhai",
                r#"host.fault("Client.Invalid", "orders", "bad order", "<reason>missing id</reason>")"#,
            )],
        );
        let dispatcher = fixture.dispatcher(ScriptedTransport::echo(), Arc::new(NoImports));

        let fault = fault_of(&dispatcher.dispatch(inbound("<Order/>")).await);
        assert_eq!(fault.code, "Client.Invalid");
        assert_eq!(fault.actor.as_deref(), Some("orders"));
        assert_eq!(fault.message, "bad order");
        assert_eq!(fault.detail.unwrap().text(), "missing id");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unparsable_fault_detail_is_dropped() {
        let fixture = Fixture::new(
            "*=fail.rhai\n",
            &[("fail.rhai", r#"host.fault("Client.Invalid", "", "bad", "<broken")"#)],
        );
        let dispatcher = fixture.dispatcher(ScriptedTransport::echo(), Arc::new(NoImports));

        let fault = fault_of(&dispatcher.dispatch(inbound("<Order/>")).await);
        assert_eq!(fault.code, "Client.Invalid");
        assert!(fault.detail.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_fault_is_passed_on() {
        let fixture = Fixture::new(
            "*=forward.rhai\n",
            &[("forward.rhai", r#"host.send_request("<Ping xmlns='urn:p'/>")"#)],
        );
        let transport = ScriptedTransport::replying(|_| {
            Ok(Envelope::with_method(
                Fault::new("Server.Down", "backend offline").to_element(Some("SOAP")),
            ))
        });
        let dispatcher = fixture.dispatcher(transport, Arc::new(NoImports));

        let fault = fault_of(&dispatcher.dispatch(inbound("<Order/>")).await);
        assert_eq!(fault.code, "Server.Down");
        assert_eq!(fault.message, "backend offline");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn preprocessor_can_stop_the_request() {
        let fixture = Fixture::new(
            "*=echo.rhai\n*.preprocessor=gate\n",
            &[("echo.rhai", r#"host.add_response("<ran/>");"#)],
        );
        let dispatcher = fixture.dispatcher(ScriptedTransport::echo(), Arc::new(NoImports));

        let stopped = dispatcher.dispatch(inbound("<Echo><block/></Echo>")).await;
        assert_eq!(stopped.kind, OutcomeKind::ShortCircuited);
        assert_eq!(child_names(&stopped.envelope), vec!["blocked"]);

        let passed = dispatcher.dispatch(inbound("<Echo/>")).await;
        assert_eq!(passed.kind, OutcomeKind::Response);
        assert_eq!(child_names(&passed.envelope), vec!["ran"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn response_is_renamed_from_override_then_interface() {
        let fixture = Fixture::new(
            "Named=named.rhai\nNamed.namespace=urn:orders\nGetOrder=plain.rhai\nGetOrder.namespace=urn:orders\n",
            &[
                (
                    "named.rhai",
                    r#"host.set_response_name("Custom"); host.set_response_namespace("urn:custom"); host.add_response("<x/>");"#,
                ),
                ("plain.rhai", r#"host.add_response("<x/>");"#),
            ],
        );
        let wsdl = r#"<definitions xmlns="http://schemas.xmlsoap.org/wsdl/"
            xmlns:tns="urn:orders/wsdl" xmlns:o="urn:orders" targetNamespace="urn:orders/wsdl">
          <message name="In"><part name="body" element="o:GetOrder"/></message>
          <message name="Out"><part name="body" element="o:OrderDetails"/></message>
          <portType name="Orders">
            <operation name="GetOrder"><input message="tns:In"/><output message="tns:Out"/></operation>
          </portType>
        </definitions>"#;
        let dispatcher = fixture.dispatcher(ScriptedTransport::echo(), StaticInterfaces::new(&[]));

        let named = dispatcher.dispatch(inbound("<Named xmlns=\"urn:orders\"/>")).await;
        let method = named.envelope.method().unwrap();
        assert_eq!(method.name(), "Custom");
        assert_eq!(method.attribute("xmlns"), Some("urn:custom"));

        let mut request = inbound("<GetOrder xmlns=\"urn:orders\"/>");
        request.metadata.method_dn = Some("cn=GetOrder,cn=Orders".into());
        request.metadata.interface = Some(wsdl.into());
        let discovered = dispatcher.dispatch(request).await;
        let method = discovered.envelope.method().unwrap();
        assert_eq!(method.name(), "OrderDetails");
        assert_eq!(method.namespace(), Some("urn:orders"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn saved_transaction_records_request_and_response() {
        let fixture = Fixture::new(
            "*=save.rhai\n",
            &[("save.rhai", r#"host.save_transaction("T1"); host.add_response("<done/>");"#)],
        );
        let dispatcher = fixture.dispatcher(ScriptedTransport::echo(), Arc::new(NoImports));
        dispatcher.dispatch(inbound("<Order xmlns=\"urn:o\"><id>1</id></Order>")).await;

        let store = TransactionStore::new(fixture.path("txn"), 500);
        let records = store.list("T1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request.root.local_name(), "Order");
        let response = records[0].response.as_ref().unwrap();
        assert_eq!(response.root.local_name(), "OrderResponse");
        assert!(response.root.child("done").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn builtin_methods_use_the_transaction_store() {
        let fixture = Fixture::new("*=never.rhai\n", &[("never.rhai", r#"host.add_response("<handler/>");"#)]);
        let store = TransactionStore::new(fixture.path("txn"), 500);
        store
            .write("T9", TransactionKind::Request, &mut Element::parse("<Ping/>").unwrap())
            .unwrap();
        let dispatcher = fixture.dispatcher(ScriptedTransport::echo(), Arc::new(NoImports));

        let mut request = inbound("<GetSavedSoapTransactions xmlns=\"urn:t\"><TransactionId>T9</TransactionId></GetSavedSoapTransactions>");
        request.metadata.implementation =
            Some("<implementation type=\"SCRIPT\"><action>GetSavedSoapTransactions</action></implementation>".into());
        let outcome = dispatcher.dispatch(request).await;
        assert_eq!(child_names(&outcome.envelope), vec!["transaction"]);

        let mut request = inbound("<DeleteSavedSoapTransactions xmlns=\"urn:t\"><TransactionId>T9</TransactionId></DeleteSavedSoapTransactions>");
        request.metadata.implementation =
            Some("<implementation><action>DeleteSavedSoapTransactions</action></implementation>".into());
        let outcome = dispatcher.dispatch(request).await;
        assert_eq!(outcome.kind, OutcomeKind::Response);
        assert!(store.list("T9").unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatcher_is_a_tower_service() {
        let fixture = Fixture::new("*=echo.rhai\n", &[("echo.rhai", r#"host.add_response("<ok/>");"#)]);
        let dispatcher = fixture.dispatcher(ScriptedTransport::echo(), Arc::new(NoImports));

        let outcome = dispatcher.oneshot(inbound("<Echo/>")).await.unwrap();
        assert_eq!(child_names(&outcome.envelope), vec!["ok"]);
    }
}
