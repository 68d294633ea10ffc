//! The isolated module graph owned by one sandbox.
//!
//! Types are loaded lazily: the first request rewrites the host definition
//! and caches the result together with the type's statics. Acquired types
//! get statics owned by this graph, so dropping the graph drops every static
//! value a test wrote. Pass-through types share the host's statics.
//!
//! A type is published only after its static initializer finished. While
//! one thread initializes it, other threads asking for it wait; the
//! initializing thread itself sees the partially initialized type, which is
//! what lets cyclic initializers make progress.

use crate::classes::{ClassDef, ClassPath};
use crate::config::Configuration;
use crate::errors::SandboxError;
use crate::rewriter::{Disposition, GraphRewriter, RewrittenClass};
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use shadow_sandbox_types::{StaticFields, TypeName};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::debug;

/// A type as loaded into this graph.
#[derive(Debug)]
pub struct LoadedClass {
    pub class: Arc<RewrittenClass>,
    pub statics: Arc<StaticFields>,
}

impl LoadedClass {
    pub fn name(&self) -> &TypeName {
        &self.class.name
    }

    pub fn is_isolated(&self) -> bool {
        self.class.disposition != Disposition::PassThrough
    }
}

enum LoadState {
    Initializing {
        class: Arc<LoadedClass>,
        owner: ThreadId,
    },
    Ready(Arc<LoadedClass>),
    Failed(String),
}

pub struct IsolatedGraph {
    class_path: Arc<ClassPath>,
    rewriter: GraphRewriter,
    loaded: Mutex<HashMap<TypeName, LoadState>>,
    /// Signalled whenever an initialization completes or fails.
    settled: Condvar,
    override_statics: Mutex<HashMap<String, Arc<StaticFields>>>,
}

impl IsolatedGraph {
    pub fn new(class_path: Arc<ClassPath>, config: Arc<Configuration>) -> Self {
        Self {
            class_path,
            rewriter: GraphRewriter::new(config),
            loaded: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
            override_statics: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<Configuration> {
        self.rewriter.config()
    }

    pub fn class_path(&self) -> &Arc<ClassPath> {
        &self.class_path
    }

    pub fn rewriter(&self) -> &GraphRewriter {
        &self.rewriter
    }

    /// Host definition for `name`, after translation.
    pub fn definition(&self, name: &TypeName) -> Option<Arc<ClassDef>> {
        self.class_path.get(self.config().translate(name))
    }

    /// `name` and its superclasses as host definitions, nearest first.
    pub fn ancestry(&self, name: &TypeName) -> Vec<Arc<ClassDef>> {
        self.class_path.ancestry(self.config().translate(name))
    }

    /// Load `name` if needed. The flag is `true` when this call loaded it,
    /// in which case the caller runs static initialization and then settles
    /// the type with [`mark_ready`](Self::mark_ready) or
    /// [`mark_failed`](Self::mark_failed).
    ///
    /// Blocks while another thread is initializing `name`.
    pub(crate) fn load(&self, name: &TypeName) -> Result<(Arc<LoadedClass>, bool)> {
        let current = thread::current().id();
        let mut loaded = self.loaded.lock();
        loop {
            match loaded.get(name) {
                Some(LoadState::Ready(class)) => return Ok((class.clone(), false)),
                Some(LoadState::Initializing { class, owner }) if *owner == current => {
                    return Ok((class.clone(), false))
                }
                Some(LoadState::Initializing { .. }) => {
                    debug!(class = %name, "waiting for static initializer on another thread");
                    self.settled.wait(&mut loaded);
                }
                Some(LoadState::Failed(message)) => {
                    return Err(SandboxError::InitializationFailed {
                        class: name.clone(),
                        message: message.clone(),
                    }
                    .into())
                }
                None => break,
            }
        }

        let def = self
            .definition(name)
            .ok_or_else(|| SandboxError::UnknownType { name: name.clone() })?;
        let rewritten = Arc::new(self.rewriter.rewrite(name, &def));
        let statics = match rewritten.disposition {
            Disposition::PassThrough => self.class_path.host_statics(name),
            _ => Arc::new(StaticFields::new()),
        };
        debug!(class = %name, disposition = ?rewritten.disposition, "loaded class into graph");

        let class = Arc::new(LoadedClass {
            class: rewritten,
            statics,
        });
        loaded.insert(
            name.clone(),
            LoadState::Initializing {
                class: class.clone(),
                owner: current,
            },
        );
        Ok((class, true))
    }

    /// Publish a type whose static initializer completed.
    pub(crate) fn mark_ready(&self, name: &TypeName) {
        let mut loaded = self.loaded.lock();
        if let Some(LoadState::Initializing { class, .. }) = loaded.remove(name) {
            loaded.insert(name.clone(), LoadState::Ready(class));
        }
        self.settled.notify_all();
    }

    /// Record a failed static initialization. Later loads fail with the same message.
    pub(crate) fn mark_failed(&self, name: &TypeName, message: String) {
        self.loaded
            .lock()
            .insert(name.clone(), LoadState::Failed(message));
        self.settled.notify_all();
    }

    /// Already-loaded type, without loading.
    pub fn get(&self, name: &TypeName) -> Option<Arc<LoadedClass>> {
        match self.loaded.lock().get(name) {
            Some(LoadState::Ready(class)) => Some(class.clone()),
            _ => None,
        }
    }

    pub fn is_loaded(&self, name: &TypeName) -> bool {
        self.get(name).is_some()
    }

    pub fn loaded_names(&self) -> Vec<TypeName> {
        let mut names: Vec<_> = self
            .loaded
            .lock()
            .iter()
            .filter(|(_, s)| matches!(s, LoadState::Ready(_)))
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Static storage owned by an override inside this graph.
    pub fn override_statics(&self, override_name: &str) -> Arc<StaticFields> {
        self.override_statics
            .lock()
            .entry(override_name.to_string())
            .or_insert_with(|| Arc::new(StaticFields::new()))
            .clone()
    }
}

impl std::fmt::Debug for IsolatedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedGraph")
            .field("loaded", &self.loaded_names())
            .finish()
    }
}
