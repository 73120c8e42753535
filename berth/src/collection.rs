//! A keyed store for resources addressable by `(user, uuid)` and, when a tag
//! is set, by `(user, tag)`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{Error, Result, ids};

/// A resource that can live in a [`TaggedCollection`]: a user scope, a uuid,
/// and an optional human-chosen tag namespaced by the user.
pub trait Taggable {
    /// Owning user key (the session public key, as text).
    fn user(&self) -> &str;
    fn uuid(&self) -> &str;
    fn tag(&self) -> Option<&str>;
}

/// Validate and normalize a tag: lowercase, `[0-9a-z._-]`, non-empty, and not
/// shaped like a uuid (which would make key-string lookup ambiguous).
pub fn valid_tag(tag: &str) -> Result<String> {
    if tag.is_empty() {
        return Err(Error::State("tag is blank".into()));
    }
    let tag = tag.to_lowercase();
    if !tag
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::State(format!("tags can only use 0-9 a-z . _ and -: {tag}")));
    }
    if ids::looks_like_id(&tag) {
        return Err(Error::State(format!("tags cannot look like uuids: {tag}")));
    }
    Ok(tag)
}

/// Double-indexed store: one entry under `(user, uuid)`, one under
/// `(user, tag)` when tagged, both pointing at the same object. `len` counts
/// objects, not index entries.
pub struct TaggedCollection<T> {
    objects: HashMap<(String, String), Arc<T>>,
    uuid_index: HashMap<String, (String, String)>,
    uniques: usize,
}

impl<T> Default for TaggedCollection<T> {
    fn default() -> Self {
        TaggedCollection {
            objects: HashMap::new(),
            uuid_index: HashMap::new(),
            uniques: 0,
        }
    }
}

impl<T: Taggable> TaggedCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.uniques
    }

    pub fn is_empty(&self) -> bool {
        self.uniques == 0
    }

    pub fn will_clash(&self, user: &str, uuid: &str, tag: Option<&str>) -> bool {
        if self.objects.contains_key(&(user.to_owned(), uuid.to_owned())) {
            return true;
        }
        tag.is_some_and(|tag| self.objects.contains_key(&(user.to_owned(), tag.to_owned())))
    }

    /// Insert an object under both of its index keys. Fails before mutating
    /// anything if either key would clash.
    pub fn add(&mut self, obj: Arc<T>) -> Result<()> {
        if self.will_clash(obj.user(), obj.uuid(), obj.tag()) {
            return Err(Error::State(format!(
                "namespace clash adding {} to collection",
                obj.uuid()
            )));
        }
        let uuid_key = (obj.user().to_owned(), obj.uuid().to_owned());
        self.uuid_index.insert(obj.uuid().to_owned(), uuid_key.clone());
        if let Some(tag) = obj.tag() {
            self.objects.insert((obj.user().to_owned(), tag.to_owned()), obj.clone());
        }
        self.objects.insert(uuid_key, obj);
        self.uniques += 1;
        Ok(())
    }

    /// Fetch by a loosely-specified key: `uuid`, `tag`, or `uuid:tag`. With a
    /// `:` the first half is tried as a uuid; a bare token matches either
    /// index.
    pub fn get(&self, user: &str, key: &str) -> Option<Arc<T>> {
        let mut parts = key.split(':');
        let first = parts.next()?;
        if parts.next().is_some() && parts.next().is_some() {
            return None; // more than uuid:tag
        }
        self.objects.get(&(user.to_owned(), first.to_owned())).cloned()
    }

    /// Fetch by uuid alone, in any user scope.
    pub fn by_uuid(&self, uuid: &str) -> Option<Arc<T>> {
        let key = self.uuid_index.get(uuid)?;
        self.objects.get(key).cloned()
    }

    pub fn remove(&mut self, obj: &T) -> Option<Arc<T>> {
        let removed = self.objects.remove(&(obj.user().to_owned(), obj.uuid().to_owned()))?;
        self.uuid_index.remove(obj.uuid());
        if let Some(tag) = obj.tag() {
            self.objects.remove(&(obj.user().to_owned(), tag.to_owned()));
        }
        self.uniques -= 1;
        Some(removed)
    }

    /// Every distinct object, via the uuid index (so tagged objects appear
    /// once).
    pub fn values(&self) -> impl Iterator<Item = &Arc<T>> {
        self.uuid_index.values().filter_map(|key| self.objects.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Res {
        user: String,
        uuid: String,
        tag: Option<String>,
    }

    impl Res {
        fn new(user: &str, uuid: &str, tag: Option<&str>) -> Arc<Res> {
            Arc::new(Res {
                user: user.to_owned(),
                uuid: uuid.to_owned(),
                tag: tag.map(str::to_owned),
            })
        }
    }

    impl Taggable for Res {
        fn user(&self) -> &str {
            &self.user
        }
        fn uuid(&self) -> &str {
            &self.uuid
        }
        fn tag(&self) -> Option<&str> {
            self.tag.as_deref()
        }
    }

    #[test]
    fn retrievable_by_uuid_and_tag() {
        let mut coll = TaggedCollection::new();
        coll.add(Res::new("alice", "u1", Some("web"))).unwrap();
        coll.add(Res::new("alice", "u2", None)).unwrap();

        assert_eq!(coll.len(), 2);
        assert_eq!(coll.get("alice", "u1").unwrap().uuid, "u1");
        assert_eq!(coll.get("alice", "web").unwrap().uuid, "u1");
        assert_eq!(coll.get("alice", "u1:web").unwrap().uuid, "u1");
        assert_eq!(coll.get("alice", "u2").unwrap().uuid, "u2");
        assert!(coll.get("bob", "u1").is_none());
        assert!(coll.get("alice", "a:b:c").is_none());
        assert_eq!(coll.by_uuid("u1").unwrap().tag.as_deref(), Some("web"));
    }

    #[test]
    fn removed_objects_are_gone_from_both_indexes() {
        let mut coll = TaggedCollection::new();
        let res = Res::new("alice", "u1", Some("web"));
        coll.add(res.clone()).unwrap();
        coll.remove(&res).unwrap();

        assert_eq!(coll.len(), 0);
        assert!(coll.get("alice", "u1").is_none());
        assert!(coll.get("alice", "web").is_none());
        assert!(coll.by_uuid("u1").is_none());
    }

    #[test]
    fn clash_leaves_collection_unchanged() {
        let mut coll = TaggedCollection::new();
        coll.add(Res::new("alice", "u1", Some("web"))).unwrap();

        // Clash on tag, under a different uuid.
        assert!(coll.add(Res::new("alice", "u9", Some("web"))).is_err());
        // Clash on uuid.
        assert!(coll.add(Res::new("alice", "u1", None)).is_err());

        assert_eq!(coll.len(), 1);
        assert!(coll.by_uuid("u9").is_none());
        assert_eq!(coll.get("alice", "web").unwrap().uuid, "u1");

        // Same uuid and tag under a different user is no clash.
        coll.add(Res::new("bob", "u1", Some("web"))).unwrap();
        assert_eq!(coll.len(), 2);
    }

    #[test]
    fn tag_validation() {
        assert_eq!(valid_tag("Web-01.x").unwrap(), "web-01.x");
        assert!(valid_tag("").is_err());
        assert!(valid_tag("has space").is_err());
        assert!(valid_tag("aaaaaaaaaaaaaaaaaaaaaa").is_err()); // uuid-shaped
        assert!(valid_tag("aaaaaaaaaaaaaaaaaaaaa").is_ok()); // 21 chars is fine
    }
}
