//! In-process participants and the values they own.
//!
//! A [`Remote`] is a value that currently lives at a [`VirtualWorker`]. It can
//! only be computed on at that worker until it is brought back with
//! [`Remote::get`]; moving the value in and out is what relocation means here.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use log::debug;

/// Id of the worker representing central ownership.
pub const LOCAL_WORKER_ID: &str = "me";

#[derive(Debug)]
struct WorkerInner {
    id: String,
    received: AtomicUsize,
}

/// A named participant. Cloning yields another handle to the same worker.
#[derive(Debug, Clone)]
pub struct VirtualWorker {
    inner: Arc<WorkerInner>,
}

impl VirtualWorker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id: id.into(),
                received: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Relocate `value` to this worker.
    pub fn send<T>(&self, value: T) -> Remote<T> {
        self.inner.received.fetch_add(1, Ordering::Relaxed);
        debug!("send {} -> {}", std::any::type_name::<T>(), self.id());
        Remote {
            value,
            location: self.clone(),
        }
    }

    /// Number of values relocated to this worker so far.
    pub fn objects_received(&self) -> usize {
        self.inner.received.load(Ordering::Relaxed)
    }
}

impl PartialEq for VirtualWorker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for VirtualWorker {}

impl fmt::Display for VirtualWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<VirtualWorker id:{}>", self.id())
    }
}

/// A value owned by a worker.
#[derive(Debug)]
pub struct Remote<T> {
    value: T,
    location: VirtualWorker,
}

impl<T> Remote<T> {
    pub fn location(&self) -> &VirtualWorker {
        &self.location
    }

    /// Bring the value back to central ownership.
    pub fn get(self) -> T {
        debug!("get {} <- {}", std::any::type_name::<T>(), self.location.id());
        self.value
    }

    /// Compute on the value where it lives; the result stays at the same worker.
    pub fn map<U>(&self, f: impl FnOnce(&T) -> U) -> Remote<U> {
        Remote {
            value: f(&self.value),
            location: self.location.clone(),
        }
    }

    /// Compute with another value held by the same worker.
    pub fn apply<U, R>(
        &mut self,
        other: &Remote<U>,
        f: impl FnOnce(&mut T, &U) -> Result<R>,
    ) -> Result<Remote<R>> {
        if self.location != other.location {
            bail!(
                "values are at different workers: {} and {}",
                self.location.id(),
                other.location.id()
            );
        }
        let value = f(&mut self.value, &other.value)?;
        Ok(Remote {
            value,
            location: self.location.clone(),
        })
    }
}

/// The local worker plus the participants taking part in a run.
#[derive(Debug)]
pub struct Federation {
    local: VirtualWorker,
    workers: Vec<VirtualWorker>,
}

impl Federation {
    pub fn new<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut workers: Vec<VirtualWorker> = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            if name == LOCAL_WORKER_ID {
                bail!("worker name '{}' is reserved", LOCAL_WORKER_ID);
            }
            if name.is_empty() {
                bail!("worker names must not be empty");
            }
            if workers.iter().any(|w| w.id() == name) {
                bail!("duplicate worker name '{}'", name);
            }
            workers.push(VirtualWorker::new(name));
        }
        Ok(Self {
            local: VirtualWorker::new(LOCAL_WORKER_ID),
            workers,
        })
    }

    pub fn local(&self) -> &VirtualWorker {
        &self.local
    }

    pub fn workers(&self) -> &[VirtualWorker] {
        &self.workers
    }

    pub fn worker(&self, id: &str) -> Option<&VirtualWorker> {
        self.workers.iter().find(|w| w.id() == id)
    }
}
