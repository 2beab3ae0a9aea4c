//! Handler registry and priority-ordered dispatch
//!
//! Handler methods are plain synchronous methods taking `&self` and one event
//! reference. The `#[event_handlers]` macro lists them for a type; the
//! registry binds each to an instance and invokes every handler whose event
//! type matches an inbound event, in ascending priority.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, warn};

use crate::event::{AnyEvent, Event};
use crate::response::{IntoReply, ResponseEvent};
use crate::Error;

type Instance = Arc<dyn Any + Send + Sync>;

/// Outcome of one handler call: an optional reply, or a failure message
type HandlerOutcome = std::result::Result<Option<ResponseEvent>, String>;

type ErasedInvoke = Arc<dyn Fn(&(dyn Any + Send + Sync), &dyn AnyEvent) -> Option<HandlerOutcome> + Send + Sync>;

/// Types whose methods can be registered as event handlers
///
/// Implemented by `#[event_handlers]`.
pub trait EventHandlers: Send + Sync + Sized + 'static {
    fn handler_methods() -> Vec<HandlerMethod<Self>>;
}

/// One handler method of `T`, bound to its event type
pub struct HandlerMethod<T> {
    name: &'static str,
    priority: i32,
    auto_register: bool,
    binding: std::result::Result<Binding<T>, String>,
}

struct Binding<T> {
    event_type: TypeId,
    event_tag: &'static str,
    invoke: Arc<dyn Fn(&T, &dyn AnyEvent) -> Option<HandlerOutcome> + Send + Sync>,
}

impl<T: Send + Sync + 'static> HandlerMethod<T> {
    pub fn new<E, O, F>(name: &'static str, priority: i32, auto_register: bool, handler: F) -> Self
    where
        E: Event,
        O: IntoReply<E::Response>,
        F: Fn(&T, &E) -> O + Send + Sync + 'static,
    {
        let invoke = move |this: &T, event: &dyn AnyEvent| -> Option<HandlerOutcome> {
            let typed = event.view_type(TypeId::of::<E>())?.downcast_ref::<E>()?;
            Some(match handler(this, typed).into_reply() {
                Ok(Some(reply)) => reply
                    .into_response(event.envelope())
                    .map(Some)
                    .map_err(|e| e.to_string()),
                Ok(None) => Ok(None),
                Err(message) => Err(message),
            })
        };

        Self {
            name,
            priority,
            auto_register,
            binding: Ok(Binding {
                event_type: TypeId::of::<E>(),
                event_tag: E::TYPE_TAG,
                invoke: Arc::new(invoke),
            }),
        }
    }

    /// A method whose signature cannot be bound; rejected at registration
    pub fn malformed(
        name: &'static str,
        priority: i32,
        auto_register: bool,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name,
            priority,
            auto_register,
            binding: Err(reason.into()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn auto_register(&self) -> bool {
        self.auto_register
    }

    pub fn event_tag(&self) -> Option<&'static str> {
        self.binding.as_ref().ok().map(|binding| binding.event_tag)
    }

    fn erase(self) -> ErasedMethod {
        let binding = self.binding.map(|binding| {
            let invoke = binding.invoke;
            let erased: ErasedInvoke = Arc::new(move |instance: &(dyn Any + Send + Sync), event: &dyn AnyEvent| {
                let this = instance.downcast_ref::<T>()?;
                invoke(this, event)
            });
            ErasedBinding {
                event_type: binding.event_type,
                event_tag: binding.event_tag,
                invoke: erased,
            }
        });

        ErasedMethod {
            declaring_type: type_name::<T>(),
            instance_type: TypeId::of::<T>(),
            name: self.name,
            priority: self.priority,
            auto_register: self.auto_register,
            binding,
        }
    }
}

impl<T> std::fmt::Debug for HandlerMethod<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerMethod")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("auto_register", &self.auto_register)
            .field("event_tag", &self.binding.as_ref().map(|b| b.event_tag))
            .finish()
    }
}

struct ErasedBinding {
    event_type: TypeId,
    event_tag: &'static str,
    invoke: ErasedInvoke,
}

struct ErasedMethod {
    declaring_type: &'static str,
    instance_type: TypeId,
    name: &'static str,
    priority: i32,
    auto_register: bool,
    binding: std::result::Result<ErasedBinding, String>,
}

/// A (type, method) pair found by the handler scanner
pub struct DiscoveredHandler {
    method: ErasedMethod,
    factory: fn() -> Instance,
}

impl DiscoveredHandler {
    /// Every handler method of `T`; instances are built with `T::default()`
    pub fn of<T: EventHandlers + Default>() -> Vec<DiscoveredHandler> {
        T::handler_methods()
            .into_iter()
            .map(|method| DiscoveredHandler {
                method: method.erase(),
                factory: new_instance::<T>,
            })
            .collect()
    }

    pub fn declaring_type(&self) -> &'static str {
        self.method.declaring_type
    }

    pub fn method_name(&self) -> &'static str {
        self.method.name
    }

    pub fn auto_register(&self) -> bool {
        self.method.auto_register
    }
}

impl std::fmt::Debug for DiscoveredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveredHandler")
            .field("declaring_type", &self.method.declaring_type)
            .field("method", &self.method.name)
            .field("auto_register", &self.method.auto_register)
            .finish()
    }
}

fn new_instance<T: Default + Send + Sync + 'static>() -> Instance {
    Arc::new(T::default())
}

#[derive(Clone)]
struct Registration {
    instance: Instance,
    instance_type: TypeId,
    declaring_type: &'static str,
    method: &'static str,
    event_type: TypeId,
    event_tag: &'static str,
    priority: i32,
    seq: u64,
    invoke: ErasedInvoke,
}

/// Summary of one registered handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerInfo {
    pub declaring_type: &'static str,
    pub method: &'static str,
    pub event_tag: &'static str,
    pub priority: i32,
}

/// Registered handlers, kept sorted by (priority, registration order)
pub struct HandlerRegistry {
    registrations: RwLock<Vec<Registration>>,
    next_seq: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register scanner output, honouring `auto_register = false`
    ///
    /// An instance of the declaring type already registered is reused;
    /// otherwise one default instance is built per type.
    pub fn register_discovered(&self, discovered: impl IntoIterator<Item = DiscoveredHandler>) -> usize {
        let mut created: HashMap<TypeId, Instance> = HashMap::new();
        let mut registered = 0;

        for handler in discovered {
            let method = handler.method;
            if !method.auto_register {
                debug!(
                    declaring_type = method.declaring_type,
                    method = method.name,
                    "Skipping handler with auto registration disabled"
                );
                continue;
            }

            let instance = match self.instance_of(method.instance_type) {
                Some(instance) => instance,
                None => created
                    .entry(method.instance_type)
                    .or_insert_with(handler.factory)
                    .clone(),
            };

            if self.add(instance, method) {
                registered += 1;
            }
        }
        registered
    }

    /// Register every handler method of `instance`, including those with
    /// auto registration disabled
    pub fn register<T: EventHandlers>(&self, instance: Arc<T>) -> usize {
        let erased: Instance = instance;
        let mut registered = 0;
        for method in T::handler_methods() {
            if self.add(erased.clone(), method.erase()) {
                registered += 1;
            }
        }
        registered
    }

    /// Remove every registration bound to `instance`
    pub fn unregister<T: Send + Sync + 'static>(&self, instance: &Arc<T>) -> usize {
        let target = Arc::as_ptr(instance) as *const u8;
        let mut registrations = self.write();
        let before = registrations.len();
        registrations.retain(|registration| Arc::as_ptr(&registration.instance) as *const u8 != target);
        before - registrations.len()
    }

    /// Invoke every handler matching `event`, in priority order
    ///
    /// Handler failures are logged and do not stop later handlers. Returns the
    /// replies produced.
    pub fn dispatch(&self, event: &dyn AnyEvent) -> Vec<ResponseEvent> {
        let matching: Vec<Registration> = self
            .read()
            .iter()
            .filter(|registration| event.view_type(registration.event_type).is_some())
            .cloned()
            .collect();

        let mut replies = Vec::new();
        for registration in matching {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                (registration.invoke)(registration.instance.as_ref(), event)
            }));

            match outcome {
                Ok(Some(Ok(Some(reply)))) => replies.push(reply),
                Ok(Some(Ok(None))) | Ok(None) => {}
                Ok(Some(Err(message))) => log_failure(&registration, event, message),
                Err(panic) => log_failure(&registration, event, panic_message(panic.as_ref())),
            }
        }
        replies
    }

    pub fn handlers(&self) -> Vec<HandlerInfo> {
        self.read()
            .iter()
            .map(|registration| HandlerInfo {
                declaring_type: registration.declaring_type,
                method: registration.method,
                event_tag: registration.event_tag,
                priority: registration.priority,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn instance_of(&self, instance_type: TypeId) -> Option<Instance> {
        self.read()
            .iter()
            .find(|registration| registration.instance_type == instance_type)
            .map(|registration| registration.instance.clone())
    }

    fn add(&self, instance: Instance, method: ErasedMethod) -> bool {
        let binding = match method.binding {
            Ok(binding) => binding,
            Err(reason) => {
                let err = Error::registration(method.declaring_type, method.name, reason);
                warn!(error = %err, "Rejected handler method");
                return false;
            }
        };

        let registration = Registration {
            instance,
            instance_type: method.instance_type,
            declaring_type: method.declaring_type,
            method: method.name,
            event_type: binding.event_type,
            event_tag: binding.event_tag,
            priority: method.priority,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            invoke: binding.invoke,
        };
        debug!(
            declaring_type = registration.declaring_type,
            method = registration.method,
            event = registration.event_tag,
            priority = registration.priority,
            "Registered handler"
        );

        let mut registrations = self.write();
        registrations.push(registration);
        registrations.sort_by_key(|registration| (registration.priority, registration.seq));
        true
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Registration>> {
        self.registrations.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Registration>> {
        self.registrations.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers())
            .finish()
    }
}

fn log_failure(registration: &Registration, event: &dyn AnyEvent, message: String) {
    let err = Error::handler_invocation(
        registration.declaring_type,
        registration.method,
        event.tag(),
        message,
    );
    let serialized = event
        .to_json()
        .unwrap_or_else(|e| format!("<unserializable: {e}>"));
    error!(
        error = %err,
        instance = ?Arc::as_ptr(&registration.instance),
        event = %serialized,
        "Handler failed"
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
