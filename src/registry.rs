//! Handler registry and dynamic registration records.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{HandlerError, RpcError, RpcResult};
use crate::handler::RequestContext;
use crate::scheduler::ProcessType;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

/// Decodes the raw params and produces the handler future. Decode failures
/// surface here, before the future exists, so the router can answer
/// `InvalidParams` instead of `InternalError`.
pub type Invoker =
    Arc<dyn Fn(Option<Value>, RequestContext) -> Result<HandlerFuture, serde_json::Error> + Send + Sync>;

pub type CapabilitySetter = Arc<dyn Fn(&Value) + Send + Sync>;

/// Everything the dispatcher needs to run one method.
pub struct HandlerRecord {
    pub method: String,
    /// `None` defers to the registry's classifier.
    pub process_type: Option<ProcessType>,
    pub invoker: Invoker,
    /// Registration-options record (document selector and friends) for
    /// `client/registerCapability`. Present iff `registration_id` is.
    pub registration_options: Option<Value>,
    /// Fresh GUID minted at registration time, used as the dynamic
    /// registration id on the wire.
    pub registration_id: Option<String>,
    /// Called with the peer's capability record once the initialize
    /// negotiation completes.
    pub capability_setter: Option<CapabilitySetter>,
}

/// Optional knobs for [`HandlerRegistry::register`].
#[derive(Default)]
pub struct HandlerOptions {
    pub process_type: Option<ProcessType>,
    pub registration_options: Option<Value>,
    pub capability_setter: Option<CapabilitySetter>,
}

impl HandlerOptions {
    pub fn serial() -> Self {
        Self {
            process_type: Some(ProcessType::Serial),
            ..Default::default()
        }
    }

    pub fn parallel() -> Self {
        Self {
            process_type: Some(ProcessType::Parallel),
            ..Default::default()
        }
    }

    pub fn with_registration_options(mut self, options: Value) -> Self {
        self.registration_options = Some(options);
        self
    }

    pub fn with_capability_setter(mut self, setter: CapabilitySetter) -> Self {
        self.capability_setter = Some(setter);
        self
    }
}

/// Payload sent to the peer for one dynamically registered method.
#[derive(Debug, Clone, Serialize)]
pub struct DynamicRegistration {
    pub id: String,
    pub method: String,
    #[serde(rename = "registerOptions", skip_serializing_if = "Option::is_none")]
    pub register_options: Option<Value>,
}

/// Method -> handler map. One handler per method; a second registration
/// for the same name fails.
pub struct HandlerRegistry {
    records: Mutex<HashMap<String, Arc<HandlerRecord>>>,
    classifier: Mutex<Arc<crate::scheduler::ProcessClassifier>>,
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            // Serial unless a registration says otherwise: correct for
            // state-changing notifications, and pure queries declare
            // themselves Parallel.
            classifier: Mutex::new(Arc::new(|_method: &str| ProcessType::Serial)),
        })
    }

    /// Replace the method classifier consulted when a registration did not
    /// pick a process type.
    pub fn set_classifier<F>(&self, classifier: F)
    where
        F: Fn(&str) -> ProcessType + Send + Sync + 'static,
    {
        *self.classifier.lock().unwrap() = Arc::new(classifier);
    }

    /// Register a typed handler. The payload type is declared here as a
    /// deserialiser the dispatcher runs before invoking; handlers receive
    /// already-typed values. Returns a handle whose drop releases the
    /// registration.
    pub fn register<P, R, F, Fut>(
        self: &Arc<Self>,
        method: &str,
        options: HandlerOptions,
        handler: F,
    ) -> RpcResult<Registration>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let invoker: Invoker = Arc::new(move |params, ctx| {
            let payload: P = serde_json::from_value(params.unwrap_or(Value::Null))?;
            let fut = handler(payload, ctx);
            Ok(Box::pin(async move {
                let result = fut.await?;
                serde_json::to_value(result).map_err(|err| HandlerError::new(err.to_string()))
            }) as HandlerFuture)
        });

        let registration_id = options
            .registration_options
            .as_ref()
            .map(|_| uuid::Uuid::new_v4().to_string());

        let record = Arc::new(HandlerRecord {
            method: method.to_string(),
            process_type: options.process_type,
            invoker,
            registration_options: options.registration_options,
            registration_id,
            capability_setter: options.capability_setter,
        });

        let mut records = self.records.lock().unwrap();
        if records.contains_key(method) {
            return Err(RpcError::DuplicateHandler(method.to_string()));
        }
        records.insert(method.to_string(), record);
        log::debug!("registered handler for {}", method);

        Ok(Registration {
            method: method.to_string(),
            registry: Arc::downgrade(self),
            active: true,
        })
    }

    pub fn lookup(&self, method: &str) -> Option<Arc<HandlerRecord>> {
        self.records.lock().unwrap().get(method).cloned()
    }

    /// Effective scheduling class for a record, falling back to the
    /// classifier when the registration left it open.
    pub fn process_type(&self, record: &HandlerRecord) -> ProcessType {
        match record.process_type {
            Some(ty) => ty,
            None => {
                let classifier = self.classifier.lock().unwrap().clone();
                classifier(&record.method)
            }
        }
    }

    fn remove(&self, method: &str) {
        if self.records.lock().unwrap().remove(method).is_some() {
            log::debug!("released handler for {}", method);
        }
    }

    /// Registration payloads for every handler that asked for dynamic
    /// registration, ready for a `client/registerCapability` request.
    pub fn dynamic_registrations(&self) -> Vec<DynamicRegistration> {
        self.records
            .lock()
            .unwrap()
            .values()
            .filter_map(|record| {
                Some(DynamicRegistration {
                    id: record.registration_id.clone()?,
                    method: record.method.clone(),
                    register_options: record.registration_options.clone(),
                })
            })
            .collect()
    }

    /// Hand the peer's capability record to every handler that registered
    /// a setter. Called once the initialize negotiation completes.
    pub fn apply_capabilities(&self, capabilities: &Value) {
        let setters: Vec<CapabilitySetter> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter_map(|record| record.capability_setter.clone())
            .collect();
        for setter in setters {
            setter(capabilities);
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

/// RAII handle for one registration. Dropping it removes the handler;
/// `detach` keeps the handler for the life of the registry.
pub struct Registration {
    method: String,
    registry: Weak<HandlerRegistry>,
    active: bool,
}

impl Registration {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Remove the handler now.
    pub fn release(mut self) {
        self.release_inner();
    }

    /// Keep the handler registered even after this handle is gone.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release_inner(&mut self) {
        if self.active {
            self.active = false;
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(&self.method);
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release_inner();
    }
}
