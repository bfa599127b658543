//! Desired-state sources for the listener set.
//!
//! A [`TopologySource`] is polled once per dispatcher iteration. The first poll yields an
//! [`ChangeEvent::Add`] for every desired listener; later polls yield only what changed,
//! and an empty list means nothing did.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};

use portico_core::Result;

use crate::config::ListenerDefinition;

/// Kind of a topology change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// Bind a new listener
    Add,
    /// Drop a listener; its live connections stay up
    Remove,
    /// Replace the mutable properties of a live listener
    Update,
}

/// One change to apply to the listener registry.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyChange {
    /// What to do
    pub event: ChangeEvent,
    /// Definition the change refers to
    pub definition: ListenerDefinition,
}

impl TopologyChange {
    /// An [`ChangeEvent::Add`] change.
    pub fn add(definition: ListenerDefinition) -> Self {
        Self {
            event: ChangeEvent::Add,
            definition,
        }
    }

    /// A [`ChangeEvent::Remove`] change.
    pub fn remove(definition: ListenerDefinition) -> Self {
        Self {
            event: ChangeEvent::Remove,
            definition,
        }
    }

    /// An [`ChangeEvent::Update`] change.
    pub fn update(definition: ListenerDefinition) -> Self {
        Self {
            event: ChangeEvent::Update,
            definition,
        }
    }
}

/// Producer of desired listener state.
pub trait TopologySource {
    /// Returns the changes since the previous poll.
    fn poll(&mut self) -> Result<Vec<TopologyChange>>;

    /// Hands back changes the dispatcher could not apply.
    ///
    /// A source that diffs against its own snapshot should forget the rejected ids so the
    /// next poll offers them again.
    fn rejected(&mut self, _changes: &[TopologyChange]) {}
}

impl<T> TopologySource for Box<T>
where
    T: TopologySource + ?Sized,
{
    fn poll(&mut self) -> Result<Vec<TopologyChange>> {
        (**self).poll()
    }

    fn rejected(&mut self, changes: &[TopologyChange]) {
        (**self).rejected(changes)
    }
}

/// Changes turning the `previous` snapshot into `next`, at most one per id.
pub fn diff(
    previous: &BTreeMap<String, ListenerDefinition>,
    next: &BTreeMap<String, ListenerDefinition>,
) -> Vec<TopologyChange> {
    let mut changes = Vec::new();
    for (id, definition) in previous {
        if !next.contains_key(id) {
            changes.push(TopologyChange::remove(definition.clone()));
        }
    }
    for (id, definition) in next {
        match previous.get(id) {
            None => changes.push(TopologyChange::add(definition.clone())),
            Some(old) if old != definition => {
                changes.push(TopologyChange::update(definition.clone()))
            }
            Some(_) => {}
        }
    }
    changes
}

/// Source fed by hand through a [`TopologyHandle`], possibly from other threads.
pub struct ManualTopology {
    rx: Receiver<TopologyChange>,
}

/// Sending side of a [`ManualTopology`].
#[derive(Clone)]
pub struct TopologyHandle {
    tx: Sender<TopologyChange>,
}

impl ManualTopology {
    /// Creates a source and the handle feeding it.
    pub fn new() -> (Self, TopologyHandle) {
        let (tx, rx) = unbounded();
        (Self { rx }, TopologyHandle { tx })
    }
}

impl TopologySource for ManualTopology {
    fn poll(&mut self) -> Result<Vec<TopologyChange>> {
        let mut changes = Vec::new();
        for change in self.rx.try_iter() {
            if change.event != ChangeEvent::Remove {
                if let Err(err) = change.definition.validate() {
                    warn!("ignoring {:?} change: {}", change.event, err);
                    continue;
                }
            }
            changes.push(change);
        }
        Ok(changes)
    }
}

impl TopologyHandle {
    /// Requests a new listener. False once the source is gone.
    pub fn add(&self, definition: ListenerDefinition) -> bool {
        self.tx.send(TopologyChange::add(definition)).is_ok()
    }

    /// Requests removal of listener `id`. False once the source is gone.
    pub fn remove(&self, id: &str) -> bool {
        self.tx
            .send(TopologyChange::remove(ListenerDefinition::new(id, 0)))
            .is_ok()
    }

    /// Requests an in-place update. False once the source is gone.
    pub fn update(&self, definition: ListenerDefinition) -> bool {
        self.tx.send(TopologyChange::update(definition)).is_ok()
    }
}

/// Source reading a JSON array of listener definitions from a file.
///
/// The file is read on every poll and parsed only when its content changed. Definitions
/// that fail validation keep their previous version, if any. A file that cannot be read
/// or parsed leaves the previous snapshot in place.
pub struct FileTopology {
    path: PathBuf,
    content: Option<String>,
    snapshot: BTreeMap<String, ListenerDefinition>,
    last_error: Option<String>,
}

impl FileTopology {
    /// Creates a source for `path`. Nothing is read until the first poll.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            content: None,
            snapshot: BTreeMap::new(),
            last_error: None,
        }
    }

    /// Path of the topology file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Definitions as of the last successful parse.
    pub fn snapshot(&self) -> &BTreeMap<String, ListenerDefinition> {
        &self.snapshot
    }

    fn report(&mut self, error: String) {
        if self.last_error.as_deref() != Some(error.as_str()) {
            warn!("topology file {}: {}", self.path.display(), error);
            self.last_error = Some(error);
        }
    }

    fn parse(&mut self, content: &str) -> Option<BTreeMap<String, ListenerDefinition>> {
        let definitions: Vec<ListenerDefinition> = match serde_json::from_str(content) {
            Ok(definitions) => definitions,
            Err(err) => {
                self.report(err.to_string());
                return None;
            }
        };

        let mut next = BTreeMap::new();
        for definition in definitions {
            let definition = match definition.validate() {
                Ok(()) => definition,
                Err(err) => match self.snapshot.get(&definition.id) {
                    Some(previous) => {
                        warn!("{}; keeping the previous definition", err);
                        previous.clone()
                    }
                    None => {
                        warn!("{}; skipping", err);
                        continue;
                    }
                },
            };
            if next.contains_key(&definition.id) {
                warn!("duplicate listener id {}, the last one wins", definition.id);
            }
            next.insert(definition.id.clone(), definition);
        }
        Some(next)
    }
}

impl TopologySource for FileTopology {
    fn poll(&mut self) -> Result<Vec<TopologyChange>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) => {
                self.report(err.to_string());
                return Ok(Vec::new());
            }
        };
        if self.content.as_deref() == Some(content.as_str()) {
            return Ok(Vec::new());
        }

        let parsed = self.parse(&content);
        self.content = Some(content);
        let Some(next) = parsed else {
            return Ok(Vec::new());
        };
        self.last_error = None;

        let changes = diff(&self.snapshot, &next);
        if !changes.is_empty() {
            info!(
                "topology file {} changed: {} change(s)",
                self.path.display(),
                changes.len()
            );
        } else {
            debug!("topology file {} rewritten without changes", self.path.display());
        }
        self.snapshot = next;
        Ok(changes)
    }

    fn rejected(&mut self, changes: &[TopologyChange]) {
        for change in changes {
            if change.event == ChangeEvent::Remove {
                continue;
            }
            if self.snapshot.remove(&change.definition.id).is_some() {
                debug!("listener {} will be offered again", change.definition.id);
                // forces a re-parse so the dropped ids come back as adds
                self.content = None;
            }
        }
    }
}
