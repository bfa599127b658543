use std::collections::HashMap;

use log::warn;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use portico_core::{Codec, Context, Error, Handler, Inspector, Packet, Result};
use portico_timer::SchedulerHandle;

use crate::config::{HandlerConfig, ListenerDefinition};

type HandlerFactory = Box<dyn Fn(&Value, &Context) -> Result<Box<dyn Handler>>>;

/// Everything a connection is assembled from.
pub struct ConnectionParts {
    /// Fresh codec instance
    pub codec: Box<dyn Codec>,
    /// Fresh inspector instance
    pub inspector: Box<dyn Inspector>,
    /// Handlers that could be constructed, in declaration order
    pub handlers: Vec<Box<dyn Handler>>,
}

/// Maps handler type tags to constructors taking typed settings.
///
/// Codecs and inspectors are closed sets described by their config enums; handlers are
/// open and have to be registered:
///
/// ```rust
/// use portico_bootstrap::ComponentRegistry;
/// use portico_core::{Context, Handler, Packet, Result};
/// use serde::Deserialize;
///
/// #[derive(Deserialize, Default)]
/// #[serde(default)]
/// struct GreeterConfig {
///     greeting: String,
/// }
///
/// struct Greeter(String);
///
/// impl Handler for Greeter {
///     fn name(&self) -> &str {
///         "Greeter"
///     }
///
///     fn handle_read(&mut self, ctx: &Context, packet: &Packet) -> Result<()> {
///         ctx.write(packet.with_payload(self.0.clone()));
///         Ok(())
///     }
/// }
///
/// let mut registry = ComponentRegistry::new();
/// registry.register_handler("greeter", |config: GreeterConfig, _ctx: &Context| {
///     Ok(Box::new(Greeter(config.greeting)) as Box<dyn Handler>)
/// });
/// assert!(registry.has_handler("greeter"));
/// ```
#[derive(Default)]
pub struct ComponentRegistry {
    handlers: HashMap<String, HandlerFactory>,
}

fn typed_config<C: DeserializeOwned>(value: &Value) -> serde_json::Result<C> {
    match serde_json::from_value(value.clone()) {
        Err(_) if value.is_null() => serde_json::from_value(Value::Object(Map::new())),
        parsed => parsed,
    }
}

impl ComponentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler constructor under `tag`, replacing any previous one.
    ///
    /// The entry's settings are deserialized into `C` first; a missing `config` is read
    /// as an empty object.
    pub fn register_handler<C, F>(&mut self, tag: &str, factory: F) -> &mut Self
    where
        C: DeserializeOwned + 'static,
        F: Fn(C, &Context) -> Result<Box<dyn Handler>> + 'static,
    {
        let owned_tag = tag.to_owned();
        self.handlers.insert(
            tag.to_owned(),
            Box::new(move |value: &Value, ctx: &Context| {
                let config = typed_config::<C>(value).map_err(|err| Error::Construction {
                    kind: "handler",
                    tag: owned_tag.clone(),
                    reason: err.to_string(),
                })?;
                factory(config, ctx)
            }),
        );
        self
    }

    /// True when a constructor is registered under `tag`.
    pub fn has_handler(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Constructs one handler.
    pub fn build_handler(&self, config: &HandlerConfig, ctx: &Context) -> Result<Box<dyn Handler>> {
        let factory = self
            .handlers
            .get(&config.kind)
            .ok_or_else(|| Error::Construction {
                kind: "handler",
                tag: config.kind.clone(),
                reason: "no handler registered under this type".to_owned(),
            })?;
        factory(&config.config, ctx)
    }

    /// Constructs the codec, inspector and handlers of a new connection.
    ///
    /// A codec failure fails the whole connection. A handler that cannot be constructed
    /// is logged and left out; the others are still built.
    pub fn build_connection_parts(
        &self,
        definition: &ListenerDefinition,
        ctx: &Context,
        scheduler: Option<&SchedulerHandle<Packet>>,
    ) -> Result<ConnectionParts> {
        let codec = definition.codec.build(scheduler)?;
        let inspector = definition.inspector.build(ctx.remote_addr());

        let mut handlers = Vec::with_capacity(definition.handlers.len());
        for config in &definition.handlers {
            match self.build_handler(config, ctx) {
                Ok(handler) => handlers.push(handler),
                Err(err) => warn!("listener {}: {}", definition.id, err),
            }
        }

        Ok(ConnectionParts {
            codec,
            inspector,
            handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct TagConfig {
        #[serde(default = "default_tag")]
        tag: String,
    }

    fn default_tag() -> String {
        "none".to_owned()
    }

    struct Tagger(String);

    impl Handler for Tagger {
        fn name(&self) -> &str {
            &self.0
        }

        fn handle_read(&mut self, _ctx: &Context, _packet: &Packet) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry.register_handler("tagger", |config: TagConfig, _ctx: &Context| {
            Ok(Box::new(Tagger(config.tag)) as Box<dyn Handler>)
        });
        registry
    }

    fn context() -> Context {
        Context::new("srv", "l", "127.0.0.1:1234".parse().unwrap())
    }

    #[test]
    fn typed_config_reaches_constructor() {
        let handler = registry()
            .build_handler(&HandlerConfig::new("tagger", json!({"tag": "x"})), &context())
            .unwrap();
        assert_eq!(handler.name(), "x");

        let handler = registry()
            .build_handler(&HandlerConfig::new("tagger", Value::Null), &context())
            .unwrap();
        assert_eq!(handler.name(), "none");
    }

    #[test]
    fn failing_handler_is_left_out() {
        let definition = ListenerDefinition::new("l", 0)
            .with_handler("tagger", json!({"tag": "first"}))
            .with_handler("missing", Value::Null)
            .with_handler("tagger", json!({"tag": 42}))
            .with_handler("tagger", json!({"tag": "last"}));

        let parts = registry()
            .build_connection_parts(&definition, &context(), None)
            .unwrap();
        let names: Vec<_> = parts.handlers.iter().map(|h| h.name().to_owned()).collect();
        assert_eq!(names, vec!["first", "last"]);
        assert_eq!(parts.inspector.id(), "127.0.0.1:1234");
    }

    #[test]
    fn unknown_tag_is_a_construction_error() {
        let err = registry()
            .build_handler(&HandlerConfig::new("nope", Value::Null), &context())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Construction { kind: "handler", .. }));
    }
}
