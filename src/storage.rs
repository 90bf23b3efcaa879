//! File-backed storage: events, tag index, notifications and registrations.
//!
//! Layout under the store root:
//!
//! ```text
//! events/ab/cd/<id>.json                     canonical event JSON
//! index/by-tag/<hex name>/<sha1 value>.txt   event ids, one per line
//! notifications/<event id>/<token>.json      notification records
//! registrations/<token>.json                 registrations keyed by token
//! pending/<event id>                         saved events awaiting fan-out
//! ```
//!
//! All writes go through [`Store::transact`]: they are buffered while the
//! closure runs and only reach disk if it returns `Ok`. Commit first writes
//! every new file to a temporary sibling; a failure there leaves the store
//! untouched. Only then are the files renamed into place and removals
//! applied, one path at a time.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BTreeSet, BinaryHeap, HashSet, VecDeque},
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;
use tracing::warn;
use walkdir::WalkDir;

use crate::event::{Event, EventId, PublicKey, Tag};
use crate::filter::{Filter, FilterSet};
use crate::notifications::Notification;
use crate::registration::{ApnsToken, RelayAddress, Registration};

/// Persistent store rooted at `root`. Clones share the transaction lock.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

enum Write {
    Put { path: PathBuf, data: Vec<u8> },
    Remove { path: PathBuf },
    RemoveDir { path: PathBuf },
}

/// A write whose new content already sits in a temporary file.
enum Staged {
    Rename(NamedTempFile, PathBuf),
    Remove(PathBuf),
    RemoveDir(PathBuf),
}

/// Buffered unit of work handed to [`Store::transact`] closures.
pub struct Transaction<'a> {
    store: &'a Store,
    writes: Vec<Write>,
}

/// One element of a [`Store::get_events`] result stream.
#[derive(Debug)]
pub enum QueryItem {
    Event(Event),
    Error(anyhow::Error),
    EndOfStoredEvents,
}

impl Store {
    /// Create a new store rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Ensure the on-disk directory structure exists.
    pub fn init(&self) -> Result<()> {
        for d in ["events", "index/by-tag", "notifications", "registrations", "pending"] {
            fs::create_dir_all(self.root.join(d))?;
        }
        Ok(())
    }

    /// Run `f` inside a transaction. Buffered writes are committed only when
    /// `f` succeeds; transactions are serialized.
    pub fn transact<T>(&self, f: impl FnOnce(&mut Transaction<'_>) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock();
        let mut tx = Transaction {
            store: self,
            writes: Vec::new(),
        };
        let out = f(&mut tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Relays named by any registration.
    pub fn relays(&self) -> Result<BTreeSet<RelayAddress>> {
        self.transact(|tx| tx.relays())
    }

    /// Keys that should be followed on `relay`.
    pub fn public_keys_for_relay(&self, relay: &RelayAddress) -> Result<HashSet<PublicKey>> {
        self.transact(|tx| tx.public_keys_for_relay(relay))
    }

    /// Push tokens registered for `pk`.
    pub fn tokens_for_public_key(&self, pk: &PublicKey) -> Result<Vec<ApnsToken>> {
        self.transact(|tx| tx.tokens_for_public_key(pk))
    }

    /// Notifications generated for `id`, oldest first.
    pub fn get_notifications(&self, id: &EventId) -> Result<Vec<Notification>> {
        self.transact(|tx| tx.get_notifications(id))
    }

    /// Saved events whose fan-out has not completed yet.
    pub fn pending_events(&self) -> Result<Vec<EventId>> {
        let dir = self.root.join("pending");
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            // Leftover temporaries from an interrupted commit.
            if name.starts_with('.') {
                continue;
            }
            ids.push(EventId::from_hex(name).with_context(|| format!("pending entry {name}"))?);
        }
        ids.sort();
        Ok(ids)
    }

    /// Lazily stream stored events matching any filter in `filters`.
    ///
    /// Each clause is evaluated on its own, newest first, capped by its own
    /// `limit`; events matched by several clauses are yielded once. The
    /// stream always ends with [`QueryItem::EndOfStoredEvents`].
    pub fn get_events(&self, filters: FilterSet) -> EventQuery {
        EventQuery {
            store: self.clone(),
            clauses: filters.filters().iter().cloned().collect(),
            pending: VecDeque::new(),
            seen: HashSet::new(),
            finished: false,
        }
    }

    /// Compute the canonical path for an event ID.
    fn event_path(&self, id: &EventId) -> PathBuf {
        let id = id.to_hex();
        self.root
            .join("events")
            .join(&id[0..2])
            .join(&id[2..4])
            .join(format!("{id}.json"))
    }

    fn tag_index_path(&self, name: &str, value: &str) -> PathBuf {
        let digest = hex::encode(Sha1::digest(value.as_bytes()));
        self.root
            .join("index/by-tag")
            .join(hex::encode(name))
            .join(format!("{digest}.txt"))
    }

    fn tag_path(&self, tag: &Tag) -> Option<PathBuf> {
        match (tag.name(), tag.value()) {
            (Some(name), Some(value)) if !name.is_empty() => Some(self.tag_index_path(name, value)),
            _ => None,
        }
    }

    fn pending_path(&self, id: &EventId) -> PathBuf {
        self.root.join("pending").join(id.to_hex())
    }

    fn notification_dir(&self, id: &EventId) -> PathBuf {
        self.root.join("notifications").join(id.to_hex())
    }

    fn notification_path(&self, id: &EventId, token: &ApnsToken) -> PathBuf {
        self.notification_dir(id).join(format!("{token}.json"))
    }

    fn registration_path(&self, token: &ApnsToken) -> PathBuf {
        self.root
            .join("registrations")
            .join(format!("{token}.json"))
    }

    fn read_event(&self, id: &EventId) -> Result<Option<Event>> {
        let path = self.event_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        let ev = Event::from_json(&data).with_context(|| format!("stored event {id}"))?;
        Ok(Some(ev))
    }

    fn all_event_ids(&self) -> Result<Vec<EventId>> {
        let mut ids = Vec::new();
        for entry in WalkDir::new(self.root.join("events")) {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(EventId::from_hex(stem)?);
            }
        }
        Ok(ids)
    }

    /// Candidate ids for a clause, narrowed by ids or the tag index when possible.
    fn candidates(&self, f: &Filter) -> Result<Vec<EventId>> {
        if !f.ids.is_empty() {
            return Ok(f.ids.clone());
        }
        if let Some((name, values)) = f.tags.iter().find(|(_, v)| !v.is_empty()) {
            let mut ids = BTreeSet::new();
            for value in values {
                ids.extend(read_ids(&self.tag_index_path(name, value))?);
            }
            return Ok(ids.into_iter().collect());
        }
        self.all_event_ids()
    }

    fn load_clause(&self, f: &Filter) -> VecDeque<QueryItem> {
        let ids = match self.candidates(f) {
            Ok(ids) => ids,
            Err(e) => return VecDeque::from([QueryItem::Error(e)]),
        };
        let mut items = VecDeque::new();
        // Min-heap on age: with a limit only the newest `limit` matches are kept.
        let mut newest = BinaryHeap::new();
        for id in ids {
            match self.read_event(&id) {
                Ok(Some(ev)) if f.matches(&ev) => {
                    newest.push(Reverse(ByAge(ev)));
                    if f.limit.is_some_and(|limit| newest.len() > limit) {
                        newest.pop();
                    }
                }
                Ok(_) => {}
                Err(e) => items.push_back(QueryItem::Error(e)),
            }
        }
        items.extend(
            newest
                .into_sorted_vec()
                .into_iter()
                .map(|Reverse(ByAge(ev))| QueryItem::Event(ev)),
        );
        items
    }

    fn load_registrations(&self) -> Result<Vec<Registration>> {
        let dir = self.root.join("registrations");
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read_to_string(&path)?;
            let reg: Registration = serde_json::from_str(&data)
                .with_context(|| format!("registration {}", path.display()))?;
            out.push(reg);
        }
        Ok(out)
    }
}

impl Transaction<'_> {
    fn put(&mut self, path: PathBuf, data: Vec<u8>) {
        self.writes.push(Write::Put { path, data });
    }

    fn remove(&mut self, path: PathBuf) {
        self.writes.push(Write::Remove { path });
    }

    fn remove_dir(&mut self, path: PathBuf) {
        self.writes.push(Write::RemoveDir { path });
    }

    /// Buffered state of `path`: `Some(Some(data))` once written in this
    /// transaction, `Some(None)` once removed, `None` when untouched.
    fn staged(&self, path: &Path) -> Option<Option<&[u8]>> {
        self.writes.iter().rev().find_map(|w| match w {
            Write::Put { path: p, data } if p == path => Some(Some(data.as_slice())),
            Write::Remove { path: p } if p == path => Some(None),
            Write::RemoveDir { path: p } if path.starts_with(p) => Some(None),
            _ => None,
        })
    }

    fn exists(&self, path: &Path) -> bool {
        match self.staged(path) {
            Some(staged) => staged.is_some(),
            None => path.exists(),
        }
    }

    fn index_ids(&self, path: &Path) -> Result<BTreeSet<EventId>> {
        match self.staged(path) {
            Some(Some(data)) => parse_ids(std::str::from_utf8(data)?),
            Some(None) => Ok(BTreeSet::new()),
            None => read_ids(path),
        }
    }

    fn put_index(&mut self, path: PathBuf, ids: &BTreeSet<EventId>) {
        if ids.is_empty() {
            self.remove(path);
            return;
        }
        let mut data = String::with_capacity(ids.len() * 65);
        for id in ids {
            data.push_str(&id.to_hex());
            data.push('\n');
        }
        self.put(path, data.into_bytes());
    }

    pub fn event_exists(&self, id: &EventId) -> Result<bool> {
        Ok(self.exists(&self.store.event_path(id)))
    }

    pub fn save_event(&mut self, ev: &Event) -> Result<()> {
        let path = self.store.event_path(&ev.id());
        self.put(path, ev.raw().as_bytes().to_vec());
        Ok(())
    }

    pub fn get_event(&self, id: &EventId) -> Result<Option<Event>> {
        match self.staged(&self.store.event_path(id)) {
            Some(Some(data)) => Ok(Some(Event::from_json(std::str::from_utf8(data)?)?)),
            Some(None) => Ok(None),
            None => self.store.read_event(id),
        }
    }

    /// Index `id` under each tag's name and value. Ids already indexed are
    /// left alone.
    pub fn save_tags(&mut self, id: &EventId, tags: &[Tag]) -> Result<()> {
        for tag in tags {
            let Some(path) = self.store.tag_path(tag) else {
                continue;
            };
            let mut ids = self.index_ids(&path)?;
            if ids.insert(*id) {
                self.put_index(path, &ids);
            }
        }
        Ok(())
    }

    /// Record that `id` still has to go through fan-out.
    pub fn mark_pending(&mut self, id: &EventId) -> Result<()> {
        let path = self.store.pending_path(id);
        self.put(path, Vec::new());
        Ok(())
    }

    pub fn is_pending(&self, id: &EventId) -> Result<bool> {
        Ok(self.exists(&self.store.pending_path(id)))
    }

    pub fn clear_pending(&mut self, id: &EventId) -> Result<()> {
        let path = self.store.pending_path(id);
        self.remove(path);
        Ok(())
    }

    pub fn save_notification(&mut self, n: &Notification) -> Result<()> {
        let path = self.store.notification_path(&n.event_id, &n.token);
        self.put(path, serde_json::to_vec(n)?);
        Ok(())
    }

    pub fn notification_exists(&self, id: &EventId, token: &ApnsToken) -> Result<bool> {
        Ok(self.exists(&self.store.notification_path(id, token)))
    }

    pub fn get_notifications(&self, id: &EventId) -> Result<Vec<Notification>> {
        let dir = self.store.notification_dir(id);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let data = fs::read_to_string(entry?.path())?;
            out.push(serde_json::from_str::<Notification>(&data)?);
        }
        out.sort_by_key(|n| n.created_at);
        Ok(out)
    }

    /// Store `reg`, replacing any earlier registration for the same token.
    pub fn save_registration(&mut self, reg: &Registration) -> Result<()> {
        let path = self.store.registration_path(&reg.apns_token);
        self.put(path, serde_json::to_vec_pretty(reg)?);
        Ok(())
    }

    /// Forget `pk`. The key is dropped from every registration and
    /// registrations left without keys are removed. Events authored by `pk`
    /// go too, along with their notifications and tag index entries.
    /// Returns the number of events deleted.
    pub fn delete_public_key(&mut self, pk: &PublicKey) -> Result<usize> {
        for mut reg in self.store.load_registrations()? {
            let before = reg.public_keys.len();
            reg.public_keys.retain(|k| k.public_key != *pk);
            if reg.public_keys.len() == before {
                continue;
            }
            if reg.public_keys.is_empty() {
                let path = self.store.registration_path(&reg.apns_token);
                self.remove(path);
            } else {
                self.save_registration(&reg)?;
            }
        }

        let mut deleted = 0;
        for id in self.store.all_event_ids()? {
            let ev = match self.get_event(&id) {
                Ok(Some(ev)) if ev.pubkey() == *pk => ev,
                Ok(_) => continue,
                Err(e) => {
                    warn!(event_id = %id, "skipping unreadable event: {e:#}");
                    continue;
                }
            };
            for tag in ev.tags() {
                let Some(path) = self.store.tag_path(tag) else {
                    continue;
                };
                let mut ids = self.index_ids(&path)?;
                if ids.remove(&id) {
                    self.put_index(path, &ids);
                }
            }
            let event_path = self.store.event_path(&id);
            self.remove(event_path);
            let notifications = self.store.notification_dir(&id);
            self.remove_dir(notifications);
            self.clear_pending(&id)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    pub fn relays(&self) -> Result<BTreeSet<RelayAddress>> {
        Ok(self
            .store
            .load_registrations()?
            .into_iter()
            .flat_map(|r| r.public_keys)
            .flat_map(|k| k.relays)
            .collect())
    }

    pub fn public_keys_for_relay(&self, relay: &RelayAddress) -> Result<HashSet<PublicKey>> {
        Ok(self
            .store
            .load_registrations()?
            .into_iter()
            .flat_map(|r| r.public_keys)
            .filter(|k| k.relays.contains(relay))
            .map(|k| k.public_key)
            .collect())
    }

    pub fn tokens_for_public_key(&self, pk: &PublicKey) -> Result<Vec<ApnsToken>> {
        Ok(self
            .store
            .load_registrations()?
            .into_iter()
            .filter(|r| r.public_keys.iter().any(|k| k.public_key == *pk))
            .map(|r| r.apns_token)
            .collect())
    }

    fn commit(self) -> Result<()> {
        let mut staged = Vec::with_capacity(self.writes.len());
        for w in self.writes {
            staged.push(match w {
                Write::Put { path, data } => {
                    let parent = path
                        .parent()
                        .ok_or_else(|| anyhow!("no parent for {}", path.display()))?;
                    fs::create_dir_all(parent)?;
                    let mut tmp = NamedTempFile::new_in(parent)?;
                    tmp.write_all(&data)?;
                    Staged::Rename(tmp, path)
                }
                Write::Remove { path } => Staged::Remove(path),
                Write::RemoveDir { path } => Staged::RemoveDir(path),
            });
        }
        for s in staged {
            match s {
                Staged::Rename(tmp, path) => {
                    tmp.persist(&path)?;
                }
                Staged::Remove(path) => ignore_missing(fs::remove_file(&path))
                    .with_context(|| format!("removing {}", path.display()))?,
                Staged::RemoveDir(path) => ignore_missing(fs::remove_dir_all(&path))
                    .with_context(|| format!("removing {}", path.display()))?,
            }
        }
        Ok(())
    }
}

fn ignore_missing(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Read newline-separated IDs from an index file.
fn read_ids(path: &Path) -> Result<BTreeSet<EventId>> {
    if !path.exists() {
        return Ok(Default::default());
    }
    parse_ids(&fs::read_to_string(path)?)
}

fn parse_ids(data: &str) -> Result<BTreeSet<EventId>> {
    data.lines()
        .filter(|l| !l.is_empty())
        .map(|l| EventId::from_hex(l).map_err(Into::into))
        .collect()
}

/// Orders events by `created_at`, ties broken by id.
struct ByAge(Event);

impl Ord for ByAge {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .created_at()
            .cmp(&other.0.created_at())
            .then_with(|| self.0.id().cmp(&other.0.id()))
    }
}

impl PartialOrd for ByAge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ByAge {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ByAge {}

/// Finite, non-restartable result stream returned by [`Store::get_events`].
pub struct EventQuery {
    store: Store,
    clauses: VecDeque<Filter>,
    pending: VecDeque<QueryItem>,
    seen: HashSet<EventId>,
    finished: bool,
}

impl Iterator for EventQuery {
    type Item = QueryItem;

    fn next(&mut self) -> Option<QueryItem> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                if let QueryItem::Event(ev) = &item {
                    if !self.seen.insert(ev.id()) {
                        continue;
                    }
                }
                return Some(item);
            }
            if let Some(clause) = self.clauses.pop_front() {
                self.pending = self.store.load_clause(&clause);
                continue;
            }
            if self.finished {
                return None;
            }
            self.finished = true;
            return Some(QueryItem::EndOfStoredEvents);
        }
    }
}
