use crate::{QueueError, Result};

pub const POISON_SUFFIX: &str = "-poison";

/// Maps logical queue names to backend queue names.
///
/// Names are trimmed and lowercased; a non-empty prefix yields `<prefix>-<queue>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueNaming {
    prefix: Option<String>,
}

impl QueueNaming {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim().to_lowercase();
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
        }
    }

    pub fn resolve(&self, queue: &str) -> Result<String> {
        let queue = queue.trim().to_lowercase();
        if queue.is_empty() {
            return Err(QueueError::InvalidName(queue));
        }
        Ok(match &self.prefix {
            Some(prefix) => format!("{}-{}", prefix, queue),
            None => queue,
        })
    }

    /// Poison sibling of a logical queue.
    pub fn resolve_poison(&self, queue: &str) -> Result<String> {
        Ok(Self::poison_of(&self.resolve(queue)?))
    }

    /// Poison sibling of an already-resolved backend queue name.
    pub fn poison_of(resolved: &str) -> String {
        format!("{}{}", resolved, POISON_SUFFIX)
    }
}
