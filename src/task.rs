//! Locked commands executed by a segment.
//!
//! Every mutating map operation is one `Task` variant run through
//! `Segment::run_task`, which holds the segment's exclusive lock for the
//! whole read-check-write. The variant decides the restructure options and,
//! given the located live entry plus an insert capability, what to change.

use crate::segment::LockedChain;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TaskOptions {
    /// Opportunistically restructure before taking the lock.
    pub(crate) restructure_before: bool,
    /// Opportunistically restructure after releasing the lock.
    pub(crate) restructure_after: bool,
    /// Skip locking entirely when the segment is empty.
    pub(crate) skip_if_empty: bool,
    /// Restructures triggered by this task may grow the table.
    pub(crate) resize: bool,
}

pub(crate) enum Task<'f, V> {
    /// `put` (overwrite) and `put_if_absent`.
    Put { value: Arc<V>, overwrite: bool },
    /// Insert the constructed value unless a live entry exists.
    PutWith(Box<dyn FnOnce() -> Arc<V> + 'f>),
    Remove,
    /// Remove only if the current value satisfies the predicate.
    RemoveIf(&'f dyn Fn(&V) -> bool),
    Replace(Arc<V>),
    /// Replace only if the current value satisfies the predicate.
    ReplaceIf {
        matches: &'f dyn Fn(&V) -> bool,
        value: Arc<V>,
    },
}

/// Key handed to a task: owned when the task may insert it.
pub(crate) enum TaskKey<'q, K, Q: ?Sized> {
    Owned(K),
    Borrowed(&'q Q),
}

#[derive(Debug)]
pub(crate) enum TaskOutcome<V> {
    Value(Option<Arc<V>>),
    Applied(bool),
    /// The live value after the task ran; produced by every `PutWith` run.
    Current(Arc<V>),
}

impl<V> TaskOutcome<V> {
    pub(crate) fn into_value(self) -> Option<Arc<V>> {
        match self {
            TaskOutcome::Value(v) => v,
            TaskOutcome::Current(v) => Some(v),
            TaskOutcome::Applied(_) => None,
        }
    }

    pub(crate) fn applied(&self) -> bool {
        match self {
            TaskOutcome::Applied(applied) => *applied,
            TaskOutcome::Value(_) | TaskOutcome::Current(_) => false,
        }
    }
}

impl<'f, V> Task<'f, V> {
    pub(crate) fn options(&self) -> TaskOptions {
        match self {
            Task::Put { .. } | Task::PutWith(_) => TaskOptions {
                restructure_before: true,
                resize: true,
                ..TaskOptions::default()
            },
            Task::Remove | Task::RemoveIf(_) => TaskOptions {
                restructure_after: true,
                skip_if_empty: true,
                ..TaskOptions::default()
            },
            Task::Replace(_) | Task::ReplaceIf { .. } => TaskOptions {
                restructure_before: true,
                skip_if_empty: true,
                ..TaskOptions::default()
            },
        }
    }

    /// Run the task body. `chain` is `None` when the segment was empty and
    /// the task asked to skip locking; `key` is `Some` only for inserting
    /// tasks.
    pub(crate) fn execute<K>(
        self,
        chain: Option<&mut LockedChain<'_, K, V>>,
        key: Option<K>,
    ) -> TaskOutcome<V> {
        let Some(chain) = chain else {
            return match self {
                Task::RemoveIf(_) | Task::ReplaceIf { .. } => TaskOutcome::Applied(false),
                // Inserting tasks never skip the lock; nothing to link into.
                Task::PutWith(make) => TaskOutcome::Current(make()),
                _ => TaskOutcome::Value(None),
            };
        };
        let current = chain.current().cloned();

        match self {
            Task::Put { value, overwrite } => match current {
                Some(previous) => {
                    if overwrite {
                        chain.set_value(&value);
                    }
                    TaskOutcome::Value(Some(previous))
                }
                None => {
                    if let Some(key) = key {
                        chain.add(key, &value);
                    }
                    TaskOutcome::Value(None)
                }
            },
            Task::PutWith(make) => match current {
                Some(existing) => TaskOutcome::Current(existing),
                None => {
                    let value = make();
                    if let Some(key) = key {
                        chain.add(key, &value);
                    }
                    TaskOutcome::Current(value)
                }
            },
            Task::Remove => match current {
                Some(previous) => {
                    chain.release();
                    TaskOutcome::Value(Some(previous))
                }
                None => TaskOutcome::Value(None),
            },
            Task::RemoveIf(matches) => match current {
                Some(previous) if matches(&*previous) => {
                    chain.release();
                    TaskOutcome::Applied(true)
                }
                _ => TaskOutcome::Applied(false),
            },
            Task::Replace(value) => match current {
                Some(previous) => {
                    chain.set_value(&value);
                    TaskOutcome::Value(Some(previous))
                }
                None => TaskOutcome::Value(None),
            },
            Task::ReplaceIf { matches, value } => match current {
                Some(previous) if matches(&*previous) => {
                    chain.set_value(&value);
                    TaskOutcome::Applied(true)
                }
                _ => TaskOutcome::Applied(false),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writers_restructure_before_and_may_resize() {
        let o = Task::Put {
            value: Arc::new(0u8),
            overwrite: true,
        }
        .options();
        assert!(o.restructure_before && o.resize);
        assert!(!o.restructure_after && !o.skip_if_empty);

        let o = Task::<u8>::PutWith(Box::new(|| Arc::new(0))).options();
        assert_eq!(
            o,
            TaskOptions {
                restructure_before: true,
                resize: true,
                ..TaskOptions::default()
            }
        );
    }

    #[test]
    fn removals_restructure_after_and_skip_empty_segments() {
        let any = |_: &u8| true;
        for task in [Task::<u8>::Remove, Task::RemoveIf(&any)] {
            let o = task.options();
            assert!(o.restructure_after && o.skip_if_empty);
            assert!(!o.restructure_before && !o.resize);
        }
    }

    #[test]
    fn replacements_never_resize() {
        let any = |_: &u8| true;
        let tasks = [
            Task::<u8>::Replace(Arc::new(1)),
            Task::ReplaceIf {
                matches: &any,
                value: Arc::new(1),
            },
        ];
        for task in tasks {
            let o = task.options();
            assert!(o.restructure_before && o.skip_if_empty);
            assert!(!o.resize);
        }
    }

    #[test]
    fn skipped_tasks_report_nothing_done() {
        let any = |_: &u8| true;
        let out = Task::<u8>::Remove.execute::<&str>(None, None);
        assert!(out.into_value().is_none());
        let out = Task::<u8>::RemoveIf(&any).execute::<&str>(None, None);
        assert!(!out.applied());
        let out = Task::ReplaceIf {
            matches: &any,
            value: Arc::new(3u8),
        }
        .execute::<&str>(None, None);
        assert!(!out.applied());
    }

    #[test]
    fn lazy_insert_always_reports_the_current_value() {
        let out = Task::<u8>::PutWith(Box::new(|| Arc::new(9))).execute::<&str>(None, None);
        assert!(matches!(out, TaskOutcome::Current(ref v) if **v == 9));
        assert_eq!(out.into_value().as_deref(), Some(&9));
    }
}
