use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use log::info;
use mio::net::TcpListener;
use mio::{Interest, Registry, Token};

use portico_core::{Error, Result};

use crate::config::ListenerDefinition;

/// A bound server socket and the definition its connections are built from.
pub(crate) struct Listener {
    pub(crate) socket: TcpListener,
    pub(crate) token: Token,
    pub(crate) local_addr: SocketAddr,
    pub(crate) definition: Rc<ListenerDefinition>,
}

/// Live listeners keyed by id, with a token index for readiness events.
///
/// Every mutation happens after the fallible OS operation it depends on succeeded, so the
/// maps and the `mio` registrations never disagree.
pub(crate) struct ListenerRegistry {
    bind_host: IpAddr,
    by_id: HashMap<String, Listener>,
    by_token: HashMap<Token, String>,
}

impl ListenerRegistry {
    pub(crate) fn new(bind_host: IpAddr) -> Self {
        Self {
            bind_host,
            by_id: HashMap::new(),
            by_token: HashMap::new(),
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Listener> {
        self.by_id.get(id)
    }

    pub(crate) fn by_token(&self, token: Token) -> Option<&Listener> {
        self.by_token.get(&token).and_then(|id| self.by_id.get(id))
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Binds and registers a new listener under `token`.
    pub(crate) fn add(
        &mut self,
        registry: &Registry,
        token: Token,
        definition: ListenerDefinition,
    ) -> Result<()> {
        definition.validate()?;
        if self.contains(&definition.id) {
            return Err(Error::Config(format!(
                "listener {} is already bound",
                definition.id
            )));
        }

        let mut socket = TcpListener::bind(SocketAddr::new(self.bind_host, definition.port))?;
        let local_addr = socket.local_addr()?;
        registry.register(&mut socket, token, Interest::READABLE)?;

        info!(
            "listener {} ({}) bound on {}",
            definition.id, definition.name, local_addr
        );
        self.by_token.insert(token, definition.id.clone());
        self.by_id.insert(
            definition.id.clone(),
            Listener {
                socket,
                token,
                local_addr,
                definition: Rc::new(definition),
            },
        );
        Ok(())
    }

    /// Deregisters and drops listener `id`. Accepted connections are not affected.
    pub(crate) fn remove(&mut self, registry: &Registry, id: &str) -> Result<()> {
        let listener = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::UnknownListener(id.to_owned()))?;
        registry.deregister(&mut listener.socket)?;

        if let Some(listener) = self.by_id.remove(id) {
            self.by_token.remove(&listener.token);
            info!("listener {} on {} removed", id, listener.local_addr);
        }
        Ok(())
    }

    /// Replaces the mutable properties of a live listener.
    ///
    /// Connections accepted afterwards use the new definition; live ones keep theirs.
    pub(crate) fn update(&mut self, definition: &ListenerDefinition) -> Result<Vec<&'static str>> {
        definition.validate()?;
        let listener = self
            .by_id
            .get_mut(&definition.id)
            .ok_or_else(|| Error::UnknownListener(definition.id.clone()))?;

        let mut next = (*listener.definition).clone();
        let changed = next.apply_update(definition)?;
        if !changed.is_empty() {
            info!("listener {} updated: {}", definition.id, changed.join(", "));
            listener.definition = Rc::new(next);
        }
        Ok(changed)
    }

    /// Deregisters and drops every listener.
    pub(crate) fn clear(&mut self, registry: &Registry) {
        for id in self.ids() {
            if let Err(err) = self.remove(registry, &id) {
                log::debug!("removing listener {}: {}", id, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use std::net::Ipv4Addr;

    fn localhost() -> ListenerRegistry {
        ListenerRegistry::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn add_then_name_only_update_keeps_binding() {
        let poll = Poll::new().unwrap();
        let mut listeners = localhost();
        listeners
            .add(poll.registry(), Token(1), ListenerDefinition::new("a", 0))
            .unwrap();
        let addr = listeners.get("a").unwrap().local_addr;

        let renamed = ListenerDefinition::new("a", 0).with_name("alpha");
        assert_eq!(listeners.update(&renamed).unwrap(), vec!["name"]);

        let listener = listeners.by_token(Token(1)).unwrap();
        assert_eq!(listener.local_addr, addr);
        assert_eq!(listener.definition.name, "alpha");
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn port_update_is_rejected() {
        let poll = Poll::new().unwrap();
        let mut listeners = localhost();
        listeners
            .add(poll.registry(), Token(1), ListenerDefinition::new("a", 0))
            .unwrap();

        let moved = ListenerDefinition::new("a", 1).with_name("moved");
        assert!(matches!(
            listeners.update(&moved),
            Err(Error::UnchangeableProperty { property: "port", .. })
        ));
        let listener = listeners.get("a").unwrap();
        assert_eq!(listener.definition.port, 0);
        assert_eq!(listener.definition.name, "a");
    }

    #[test]
    fn bind_failure_leaves_registry_unchanged() {
        let poll = Poll::new().unwrap();
        let mut listeners = localhost();
        listeners
            .add(poll.registry(), Token(1), ListenerDefinition::new("a", 0))
            .unwrap();
        let port = listeners.get("a").unwrap().local_addr.port();

        let clash = ListenerDefinition::new("b", port);
        assert!(listeners.add(poll.registry(), Token(2), clash).is_err());
        assert!(!listeners.contains("b"));
        assert!(listeners.by_token(Token(2)).is_none());
    }

    #[test]
    fn remove_unknown_and_known() {
        let poll = Poll::new().unwrap();
        let mut listeners = localhost();
        assert!(matches!(
            listeners.remove(poll.registry(), "ghost"),
            Err(Error::UnknownListener(_))
        ));

        listeners
            .add(poll.registry(), Token(5), ListenerDefinition::new("a", 0))
            .unwrap();
        listeners.remove(poll.registry(), "a").unwrap();
        assert_eq!(listeners.len(), 0);
        assert!(listeners.by_token(Token(5)).is_none());
        assert!(matches!(
            listeners.update(&ListenerDefinition::new("a", 0)),
            Err(Error::UnknownListener(_))
        ));
    }
}
