use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

/// Where a provider's hook sits relative to another named provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Position {
    /// Registration order
    #[default]
    Default,
    Before(String),
    After(String),
}

/// Positions for the two stages of an interceptor. Around-tx hooks placed first are outermost;
/// on-tx hooks placed first run their storage work first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ordering {
    pub around_tx: Position,
    pub on_tx: Position,
}

impl Ordering {
    pub fn before(name: &str) -> Self {
        Self {
            around_tx: Position::Before(name.to_string()),
            on_tx: Position::Before(name.to_string()),
        }
    }

    pub fn after(name: &str) -> Self {
        Self {
            around_tx: Position::After(name.to_string()),
            on_tx: Position::After(name.to_string()),
        }
    }
}

/// Startup configuration errors. Any of these aborts boot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterceptorError {
    #[error("interceptor provider '{name}' is registered more than once")]
    DuplicateName { name: String },
    #[error("interceptor provider '{name}' is ordered relative to unknown provider '{dependency}'")]
    UnknownDependency { name: String, dependency: String },
    #[error("interceptor providers {names:?} have cyclic ordering constraints")]
    Cycle { names: Vec<String> },
}

/// Creates interceptors of kind `I` and declares where they go in the chain.
pub trait Provider<I: ?Sized>: Send + Sync {
    fn name(&self) -> &str;

    fn ordering(&self) -> Ordering {
        Ordering::default()
    }

    fn provide(&self) -> Arc<I>;
}

/// Provider handing out one shared interceptor instance.
pub struct SharedProvider<I: ?Sized> {
    name: String,
    ordering: Ordering,
    interceptor: Arc<I>,
}

impl<I: ?Sized> SharedProvider<I> {
    pub fn new(name: &str, interceptor: Arc<I>) -> Self {
        Self {
            name: name.to_string(),
            ordering: Ordering::default(),
            interceptor,
        }
    }

    pub fn ordered(mut self, ordering: Ordering) -> Self {
        self.ordering = ordering;
        self
    }
}

impl<I: ?Sized + Send + Sync> Provider<I> for SharedProvider<I> {
    fn name(&self) -> &str {
        &self.name
    }

    fn ordering(&self) -> Ordering {
        self.ordering.clone()
    }

    fn provide(&self) -> Arc<I> {
        self.interceptor.clone()
    }
}

/// Resolves the execution order of named entries.
///
/// Entries are placed in registration order. An entry constrained `Before`/`After` another is
/// placed immediately next to it once that one is placed. Returns indices into `entries`.
pub fn resolve_order(entries: &[(&str, Position)]) -> Result<Vec<usize>, InterceptorError> {
    let mut seen = HashSet::new();
    for (name, _) in entries {
        if !seen.insert(*name) {
            return Err(InterceptorError::DuplicateName {
                name: name.to_string(),
            });
        }
    }
    for (name, position) in entries {
        if let Position::Before(dependency) | Position::After(dependency) = position {
            if !seen.contains(dependency.as_str()) {
                return Err(InterceptorError::UnknownDependency {
                    name: name.to_string(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    let mut placed: Vec<usize> = Vec::with_capacity(entries.len());
    let mut pending: Vec<usize> = (0..entries.len()).collect();
    while !pending.is_empty() {
        let mut progressed = false;
        pending.retain(|&index| {
            let slot = match &entries[index].1 {
                Position::Default => Some(placed.len()),
                Position::Before(dependency) => placed
                    .iter()
                    .position(|&other| entries[other].0 == dependency),
                Position::After(dependency) => placed
                    .iter()
                    .position(|&other| entries[other].0 == dependency)
                    .map(|at| at + 1),
            };
            match slot {
                Some(slot) => {
                    placed.insert(slot, index);
                    progressed = true;
                    false
                }
                None => true,
            }
        });
        if !progressed {
            return Err(InterceptorError::Cycle {
                names: pending.iter().map(|&i| entries[i].0.to_string()).collect(),
            });
        }
    }
    Ok(placed)
}

/// Instantiates the interceptors of `providers` once and orders them for both stages.
pub fn build_stages<I: ?Sized>(
    providers: &[Arc<dyn Provider<I>>],
) -> Result<(Vec<Arc<I>>, Vec<Arc<I>>), InterceptorError> {
    let orderings: Vec<Ordering> = providers.iter().map(|p| p.ordering()).collect();
    let around: Vec<(&str, Position)> = providers
        .iter()
        .zip(&orderings)
        .map(|(p, o)| (p.name(), o.around_tx.clone()))
        .collect();
    let on_tx: Vec<(&str, Position)> = providers
        .iter()
        .zip(&orderings)
        .map(|(p, o)| (p.name(), o.on_tx.clone()))
        .collect();

    let around_order = resolve_order(&around)?;
    let on_tx_order = resolve_order(&on_tx)?;

    let interceptors: Vec<Arc<I>> = providers.iter().map(|p| p.provide()).collect();
    Ok((
        around_order.iter().map(|&i| interceptors[i].clone()).collect(),
        on_tx_order.iter().map(|&i| interceptors[i].clone()).collect(),
    ))
}
