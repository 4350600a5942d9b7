//! Canonicalizes announcements into stable speaker identities.
//!
//! The registry is the only place that decides whether an announcement is a
//! new speaker, a known one arriving again (possibly from the other service
//! type or with a new address), or something to ignore. It also holds the
//! externally-owned set published by the capability bridge.
//!
//! # Invariants
//!
//! - Identity is keyed by the hardware id, never by address.
//! - `NewIdentity` is returned at most once per id for the process lifetime,
//!   even across user removal and re-announcement.
//! - An externally-owned id always resolves to `Ignored`.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;

use crate::airplay::discovery::{Announcement, ServiceKind};
use crate::airplay::types::{SpeakerId, SpeakerIdentity, SpeakerRoute};

/// Why an announcement did not produce a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The group leader already manages this device.
    ExternallyOwned(SpeakerId),
    /// The record carries no usable hardware identifier.
    MissingIdentifier,
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExternallyOwned(_) => write!(f, "externally owned"),
            Self::MissingIdentifier => write!(f, "missing hardware identifier"),
        }
    }
}

/// Outcome of [`IdentityRegistry::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// First sighting of this id in the process lifetime.
    NewIdentity(SpeakerId),
    /// Already seen; routing info may have been updated.
    KnownIdentity(SpeakerId),
    Ignored(IgnoreReason),
}

/// Result of publishing a new externally-owned set.
#[derive(Debug, Default)]
pub struct OwnershipChange {
    /// Ids that just became externally owned and have a registry record.
    pub excluded: Vec<SpeakerId>,
    /// Last announcements of ids that are no longer externally owned, to be
    /// resolved again.
    pub released: Vec<Announcement>,
}

/// A live service record: its kind and instance name.
type Source = (ServiceKind, String);

#[derive(Debug)]
struct Record {
    identity: SpeakerIdentity,
    route: Option<SpeakerRoute>,
    /// Every live instance announcing this id, across both service types.
    sources: HashSet<Source>,
    last_announcement: Announcement,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<SpeakerId, Record>,
    /// Ids for which `NewIdentity` has been returned.
    seen: HashSet<SpeakerId>,
    /// Live source → id, for resolving removals.
    instances: HashMap<Source, SpeakerId>,
    externally_owned: BTreeSet<SpeakerId>,
}

/// Thread-safe identity registry.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    inner: RwLock<Inner>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves one announcement.
    pub fn resolve(&self, announcement: &Announcement) -> Resolution {
        let Some(id) = announcement.hardware_id() else {
            log::debug!(
                "[Registry] Ignoring {} record '{}' without hardware id",
                announcement.kind,
                announcement.instance_name
            );
            return Resolution::Ignored(IgnoreReason::MissingIdentifier);
        };

        let route = announcement.address.map(|address| SpeakerRoute {
            address,
            port: announcement.port,
        });

        let source: Source = (announcement.kind, announcement.instance_name.clone());
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.instances.insert(source.clone(), id.clone());

        match inner.records.get_mut(&id) {
            Some(record) => {
                record.sources.insert(source);
                record.last_announcement = announcement.clone();
                if route.is_some() && record.route != route {
                    log::info!(
                        "[Registry] {} moved: {:?} -> {:?}",
                        id,
                        record.route,
                        route
                    );
                    record.route = route;
                }
            }
            None => {
                let flags = announcement.capability_flags();
                let identity = SpeakerIdentity {
                    id: id.clone(),
                    display_name: announcement.display_name(),
                    model: announcement.model(),
                    protocol_version: flags.protocol_version(),
                    capability_flags: flags,
                };
                inner.records.insert(
                    id.clone(),
                    Record {
                        identity,
                        route,
                        sources: HashSet::from([source]),
                        last_announcement: announcement.clone(),
                    },
                );
            }
        }

        if inner.externally_owned.contains(&id) {
            return Resolution::Ignored(IgnoreReason::ExternallyOwned(id));
        }

        if inner.seen.insert(id.clone()) {
            log::info!(
                "[Registry] New speaker {} via {} record",
                id,
                announcement.kind
            );
            Resolution::NewIdentity(id)
        } else {
            Resolution::KnownIdentity(id)
        }
    }

    /// Records the withdrawal of one service record.
    ///
    /// Returns the id when its last live instance disappeared; the record
    /// is dropped. Another instance of the same kind keeps the id alive.
    pub fn record_loss(&self, kind: ServiceKind, instance_name: &str) -> Option<SpeakerId> {
        let source: Source = (kind, instance_name.to_string());
        let mut inner = self.inner.write();
        let id = inner.instances.remove(&source)?;

        let record = inner.records.get_mut(&id)?;
        record.sources.remove(&source);
        if !record.sources.is_empty() {
            log::debug!(
                "[Registry] {} still announced by {} record(s)",
                id,
                record.sources.len()
            );
            return None;
        }

        inner.records.remove(&id);
        inner.instances.retain(|_, mapped| *mapped != id);
        log::info!("[Registry] All sources lost for {}", id);
        Some(id)
    }

    /// Drops routing info for a user-removed speaker.
    ///
    /// The id stays in the seen set, so re-announcement yields `KnownIdentity`.
    pub fn forget(&self, id: &SpeakerId) -> bool {
        let mut inner = self.inner.write();
        inner.instances.retain(|_, mapped| mapped != id);
        inner.records.remove(id).is_some()
    }

    /// Replaces the externally-owned set.
    pub fn set_externally_owned(&self, owned: BTreeSet<SpeakerId>) -> OwnershipChange {
        let mut inner = self.inner.write();

        let excluded = owned
            .difference(&inner.externally_owned)
            .filter(|id| inner.records.contains_key(*id))
            .cloned()
            .collect();

        let released = inner
            .externally_owned
            .difference(&owned)
            .filter_map(|id| inner.records.get(id))
            .map(|record| record.last_announcement.clone())
            .collect();

        inner.externally_owned = owned;
        OwnershipChange { excluded, released }
    }

    pub fn is_externally_owned(&self, id: &SpeakerId) -> bool {
        self.inner.read().externally_owned.contains(id)
    }

    pub fn externally_owned(&self) -> BTreeSet<SpeakerId> {
        self.inner.read().externally_owned.clone()
    }

    pub fn identity(&self, id: &SpeakerId) -> Option<SpeakerIdentity> {
        self.inner
            .read()
            .records
            .get(id)
            .map(|record| record.identity.clone())
    }

    pub fn route(&self, id: &SpeakerId) -> Option<SpeakerRoute> {
        self.inner.read().records.get(id).and_then(|record| record.route)
    }

    /// Identities with a live record that are not externally owned.
    pub fn identities(&self) -> Vec<SpeakerIdentity> {
        let inner = self.inner.read();
        let mut identities: Vec<_> = inner
            .records
            .values()
            .filter(|record| !inner.externally_owned.contains(&record.identity.id))
            .map(|record| record.identity.clone())
            .collect();
        identities.sort_by(|a, b| a.id.cmp(&b.id));
        identities
    }

    /// Number of identities eligible for a session.
    pub fn len(&self) -> usize {
        self.identities().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
