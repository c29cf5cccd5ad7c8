use std::sync::Arc;
use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tracing::info;

/// Receiver side admission policy for incoming messages, selected by the message's tag.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AcceptMode {
    /// acknowledge and dispatch to the receiver
    Accept,
    /// ignore silently, so the sender retransmits and eventually fails over
    Drop,
    /// send a NACK, so the sender fails over immediately
    Reject,
}

#[derive(Debug, Clone)]
struct AcceptModes {
    default: AcceptMode,
    per_tag: FxHashMap<String, AcceptMode>,
}

/// The currently effective accept modes. Updates replace the whole table atomically, so readers
///  on the receive path never block.
pub struct AcceptPolicy {
    modes: ArcSwap<AcceptModes>,
}

impl AcceptPolicy {
    pub fn new(default: AcceptMode, per_tag: FxHashMap<String, AcceptMode>) -> AcceptPolicy {
        AcceptPolicy {
            modes: ArcSwap::from_pointee(AcceptModes { default, per_tag }),
        }
    }

    /// Sets the accept mode for the given tags, or the default mode if no tags are given. Tag
    ///  specific modes remain in place when the default changes.
    pub fn set_accept_mode(&self, mode: AcceptMode, tags: &[&str]) {
        self.modes.rcu(|current| {
            let mut updated = AcceptModes::clone(current);
            if tags.is_empty() {
                updated.default = mode;
            }
            else {
                for &tag in tags {
                    updated.per_tag.insert(tag.to_string(), mode);
                }
            }
            Arc::new(updated)
        });

        if tags.is_empty() {
            info!(?mode, "default accept mode changed");
        }
        else {
            info!(?mode, ?tags, "accept mode changed");
        }
    }

    /// removes tag specific modes so that the tags fall back to the default mode
    pub fn clear_accept_mode(&self, tags: &[&str]) {
        self.modes.rcu(|current| {
            let mut updated = AcceptModes::clone(current);
            for tag in tags {
                updated.per_tag.remove(*tag);
            }
            Arc::new(updated)
        });
    }

    pub fn accept_mode_for(&self, tag: Option<&str>) -> AcceptMode {
        let modes = self.modes.load();
        tag.and_then(|tag| modes.per_tag.get(tag))
            .copied()
            .unwrap_or(modes.default)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn policy() -> AcceptPolicy {
        let mut per_tag = FxHashMap::default();
        per_tag.insert("X".to_string(), AcceptMode::Reject);
        AcceptPolicy::new(AcceptMode::Accept, per_tag)
    }

    #[rstest]
    #[case::untagged(None, AcceptMode::Accept)]
    #[case::unknown_tag(Some("Y"), AcceptMode::Accept)]
    #[case::tag_override(Some("X"), AcceptMode::Reject)]
    fn test_initial(#[case] tag: Option<&str>, #[case] expected: AcceptMode) {
        assert_eq!(policy().accept_mode_for(tag), expected);
    }

    #[test]
    fn test_set_default_keeps_overrides() {
        let policy = policy();
        policy.set_accept_mode(AcceptMode::Drop, &[]);
        assert_eq!(policy.accept_mode_for(None), AcceptMode::Drop);
        assert_eq!(policy.accept_mode_for(Some("Y")), AcceptMode::Drop);
        assert_eq!(policy.accept_mode_for(Some("X")), AcceptMode::Reject);
    }

    #[test]
    fn test_set_for_tags() {
        let policy = policy();
        policy.set_accept_mode(AcceptMode::Drop, &["Y", "Z"]);
        assert_eq!(policy.accept_mode_for(Some("Y")), AcceptMode::Drop);
        assert_eq!(policy.accept_mode_for(Some("Z")), AcceptMode::Drop);
        assert_eq!(policy.accept_mode_for(None), AcceptMode::Accept);

        policy.clear_accept_mode(&["Y"]);
        assert_eq!(policy.accept_mode_for(Some("Y")), AcceptMode::Accept);
        assert_eq!(policy.accept_mode_for(Some("Z")), AcceptMode::Drop);
    }
}
