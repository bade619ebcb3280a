//! Host-defined classes instantiable from scripts.
//!
//! A receiver is a named constructor. When a script instantiates the class,
//! the runtime sends a `new` message carrying the handle it picked for the
//! instance; the object the constructor returns is stored under that handle
//! and later property and method messages are resolved against it.
//!
//! Messages that do not resolve to a live object are answered with
//! [`ReceiverResponse::NotFound`] instead of failing.

use std::collections::HashMap;

use tracing::debug;

use php_embed_common::{CallbackError, EngineError};

use crate::native::InstanceHandle;
use crate::value::HostValue;

/// A host object driven from script code.
///
/// Every method has a neutral default, so an implementation only provides
/// what it supports.
pub trait ReceiverObject: Send {
    /// Read a property.
    fn get(&self, _property: &str) -> Option<HostValue> {
        None
    }

    /// Write a property.
    fn set(&mut self, _property: &str, _value: HostValue) {}

    /// Whether a property exists.
    fn exists(&self, _property: &str) -> bool {
        false
    }

    /// Invoke a method. `None` is returned to the script as null.
    fn call(&mut self, _method: &str, _args: Vec<HostValue>) -> Option<HostValue> {
        None
    }
}

/// Receiver constructor. An `Err` rejects the arguments and is surfaced to
/// the script as an exception.
pub type Constructor =
    Box<dyn Fn(Vec<HostValue>) -> Result<Box<dyn ReceiverObject>, String> + Send + Sync>;

/// A named receiver and its live objects.
struct Receiver {
    constructor: Constructor,
    objects: HashMap<InstanceHandle, Box<dyn ReceiverObject>>,
}

/// Message sent by the runtime to a receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverMessage<'a> {
    New {
        receiver: &'a str,
        instance: InstanceHandle,
        args: Vec<HostValue>,
    },
    Get {
        receiver: &'a str,
        instance: InstanceHandle,
        property: &'a str,
    },
    Set {
        receiver: &'a str,
        instance: InstanceHandle,
        property: &'a str,
        value: HostValue,
    },
    Exists {
        receiver: &'a str,
        instance: InstanceHandle,
        property: &'a str,
    },
    Call {
        receiver: &'a str,
        instance: InstanceHandle,
        method: &'a str,
        args: Vec<HostValue>,
    },
    Release {
        receiver: &'a str,
        instance: InstanceHandle,
    },
}

impl<'a> ReceiverMessage<'a> {
    fn target(&self) -> (&'a str, InstanceHandle) {
        match self {
            Self::New {
                receiver, instance, ..
            }
            | Self::Get {
                receiver, instance, ..
            }
            | Self::Set {
                receiver, instance, ..
            }
            | Self::Exists {
                receiver, instance, ..
            }
            | Self::Call {
                receiver, instance, ..
            }
            | Self::Release { receiver, instance } => (*receiver, *instance),
        }
    }
}

/// Answer to a [`ReceiverMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverResponse {
    /// The object was constructed and stored.
    Created,
    /// A property value or method result; null when there was none.
    Value(HostValue),
    /// Answer to an existence check.
    Exists(bool),
    /// The operation was applied.
    Done,
    /// The message did not resolve to a live object.
    NotFound(CallbackError),
    /// The constructor rejected its arguments.
    Rejected(CallbackError),
}

/// Table of receivers defined on an engine.
#[derive(Default)]
pub struct ReceiverRegistry {
    receivers: HashMap<String, Receiver>,
}

impl ReceiverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receiver under a unique name.
    pub fn define(&mut self, name: &str, constructor: Constructor) -> Result<(), EngineError> {
        if self.receivers.contains_key(name) {
            return Err(EngineError::duplicate_receiver(name));
        }

        self.receivers.insert(
            name.to_string(),
            Receiver {
                constructor,
                objects: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Number of defined receivers.
    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.receivers.contains_key(name)
    }

    /// Number of live objects across all receivers.
    pub fn live_objects(&self) -> usize {
        self.receivers.values().map(|r| r.objects.len()).sum()
    }

    /// Drop every receiver and object.
    pub fn clear(&mut self) {
        self.receivers.clear();
    }

    /// Answer a message from the runtime.
    pub fn handle(&mut self, message: ReceiverMessage<'_>) -> ReceiverResponse {
        let (name, instance) = message.target();
        let Some(receiver) = self.receivers.get_mut(name) else {
            return ReceiverResponse::NotFound(CallbackError::UnknownReceiver {
                name: name.to_string(),
            });
        };

        if let ReceiverMessage::New { receiver: name, args, .. } = message {
            return match (receiver.constructor)(args) {
                Ok(object) => {
                    receiver.objects.insert(instance, object);
                    debug!(receiver = name, instance = instance.0, "Receiver object created");
                    ReceiverResponse::Created
                }
                Err(reason) => ReceiverResponse::Rejected(CallbackError::ConstructorRejected {
                    receiver: name.to_string(),
                    reason,
                }),
            };
        }

        if let ReceiverMessage::Release { receiver: name, .. } = message {
            return match receiver.objects.remove(&instance) {
                Some(_) => {
                    debug!(receiver = name, instance = instance.0, "Receiver object released");
                    ReceiverResponse::Done
                }
                None => ReceiverResponse::NotFound(unknown_instance(name, instance)),
            };
        }

        let Some(object) = receiver.objects.get_mut(&instance) else {
            return ReceiverResponse::NotFound(unknown_instance(name, instance));
        };

        match message {
            ReceiverMessage::Get { property, .. } => {
                ReceiverResponse::Value(object.get(property).unwrap_or_default())
            }
            ReceiverMessage::Set {
                property, value, ..
            } => {
                object.set(property, value);
                ReceiverResponse::Done
            }
            ReceiverMessage::Exists { property, .. } => {
                ReceiverResponse::Exists(object.exists(property))
            }
            ReceiverMessage::Call { method, args, .. } => {
                ReceiverResponse::Value(object.call(method, args).unwrap_or_default())
            }
            ReceiverMessage::New { .. } | ReceiverMessage::Release { .. } => {
                ReceiverResponse::Done
            }
        }
    }
}

fn unknown_instance(receiver: &str, instance: InstanceHandle) -> CallbackError {
    CallbackError::UnknownInstance {
        receiver: receiver.to_string(),
        instance: instance.0,
    }
}

type Method = Box<dyn FnMut(&mut HashMap<String, HostValue>, Vec<HostValue>) -> HostValue + Send>;

/// A [`ReceiverObject`] assembled from named properties and method closures.
///
/// Methods receive the property table, so they can read and update state.
#[derive(Default)]
pub struct DynamicObject {
    properties: HashMap<String, HostValue>,
    methods: HashMap<String, Method>,
}

impl DynamicObject {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: FnMut(&mut HashMap<String, HostValue>, Vec<HostValue>) -> HostValue + Send + 'static,
    {
        self.methods.insert(name.into(), Box::new(method));
        self
    }
}

impl ReceiverObject for DynamicObject {
    fn get(&self, property: &str) -> Option<HostValue> {
        self.properties.get(property).cloned()
    }

    fn set(&mut self, property: &str, value: HostValue) {
        self.properties.insert(property.to_string(), value);
    }

    fn exists(&self, property: &str) -> bool {
        self.properties.contains_key(property)
    }

    fn call(&mut self, method: &str, args: Vec<HostValue>) -> Option<HostValue> {
        let method = self.methods.get_mut(method)?;
        Some(method(&mut self.properties, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeter() -> Constructor {
        Box::new(|args: Vec<HostValue>| {
            let name = args
                .first()
                .and_then(HostValue::as_str)
                .ok_or_else(|| "missing name".to_string())?
                .to_string();
            Ok(Box::new(
                DynamicObject::new()
                    .with_property("name", name)
                    .with_method("hello", |props, _| {
                        let name = props.get("name").and_then(HostValue::as_str).unwrap_or("");
                        HostValue::from(format!("Hello, {name}"))
                    }),
            ) as Box<dyn ReceiverObject>)
        })
    }

    #[test]
    fn test_define_duplicate_fails() {
        let mut registry = ReceiverRegistry::new();

        registry.define("X", greeter()).unwrap();
        let err = registry.define("X", greeter()).unwrap_err();

        assert!(matches!(err, EngineError::DuplicateReceiver { ref name } if name == "X"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_new_get_call_release() {
        let mut registry = ReceiverRegistry::new();
        registry.define("Greeter", greeter()).unwrap();
        let instance = InstanceHandle(1);

        let created = registry.handle(ReceiverMessage::New {
            receiver: "Greeter",
            instance,
            args: vec![HostValue::from("world")],
        });
        assert_eq!(created, ReceiverResponse::Created);
        assert_eq!(registry.live_objects(), 1);

        let name = registry.handle(ReceiverMessage::Get {
            receiver: "Greeter",
            instance,
            property: "name",
        });
        assert_eq!(name, ReceiverResponse::Value(HostValue::from("world")));

        let greeting = registry.handle(ReceiverMessage::Call {
            receiver: "Greeter",
            instance,
            method: "hello",
            args: vec![],
        });
        assert_eq!(greeting, ReceiverResponse::Value(HostValue::from("Hello, world")));

        let released = registry.handle(ReceiverMessage::Release {
            receiver: "Greeter",
            instance,
        });
        assert_eq!(released, ReceiverResponse::Done);
        assert_eq!(registry.live_objects(), 0);
    }

    #[test]
    fn test_constructor_rejection() {
        let mut registry = ReceiverRegistry::new();
        registry.define("Greeter", greeter()).unwrap();

        let response = registry.handle(ReceiverMessage::New {
            receiver: "Greeter",
            instance: InstanceHandle(1),
            args: vec![],
        });

        assert!(matches!(
            response,
            ReceiverResponse::Rejected(CallbackError::ConstructorRejected { .. })
        ));
        assert_eq!(registry.live_objects(), 0);
    }

    #[test]
    fn test_misses_are_not_found() {
        let mut registry = ReceiverRegistry::new();
        registry.define("Greeter", greeter()).unwrap();

        let response = registry.handle(ReceiverMessage::Get {
            receiver: "Unknown",
            instance: InstanceHandle(1),
            property: "name",
        });
        assert!(matches!(
            response,
            ReceiverResponse::NotFound(CallbackError::UnknownReceiver { .. })
        ));

        let response = registry.handle(ReceiverMessage::Exists {
            receiver: "Greeter",
            instance: InstanceHandle(99),
            property: "name",
        });
        assert!(matches!(
            response,
            ReceiverResponse::NotFound(CallbackError::UnknownInstance { instance: 99, .. })
        ));
    }

    #[test]
    fn test_dynamic_object_set_and_exists() {
        let mut object = DynamicObject::new().with_property("count", 1);

        assert!(object.exists("count"));
        assert!(!object.exists("missing"));

        object.set("count", HostValue::Int(2));
        assert_eq!(object.get("count"), Some(HostValue::Int(2)));
        assert_eq!(object.call("missing", vec![]), None);
    }
}
