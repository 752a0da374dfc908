//! Topic table binding topic names and ids to application handlers.
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use super::message::{QoS, TopicType};

/// Inbound publication handed to a [TopicHandler].
#[derive(Clone, Debug)]
pub struct Publication<'a> {
    pub topic_id: u16,
    pub topic_type: TopicType,
    /// Name of the table entry the publication was matched to, if any.
    pub topic_name: Option<&'a str>,
    pub qos: QoS,
    pub retain: bool,
    pub payload: &'a [u8],
    pub rssi: i16,
    pub snr: i8,
}

/// Callback invoked for every publication received on a topic.
pub trait TopicHandler {
    fn on_publish(&self, publication: &Publication<'_>);
}

impl<F> TopicHandler for F
where
    F: Fn(&Publication<'_>),
{
    fn on_publish(&self, publication: &Publication<'_>) {
        self(publication)
    }
}

pub type Handler = Rc<dyn TopicHandler>;

/// One row of the topic table.
#[derive(Clone)]
pub struct TopicEntry {
    /// Empty for predefined topics known by id only.
    pub name: String,
    /// 0 until the gateway assigned one.
    pub id: u16,
    pub topic_type: TopicType,
    pub handler: Option<Handler>,
}

impl fmt::Debug for TopicEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicEntry")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("topic_type", &self.topic_type)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl TopicEntry {
    pub fn is_wildcard(&self) -> bool {
        self.name.contains(['+', '#'])
    }
}

/// Id of a two character short topic.
pub fn short_topic_id(name: &str) -> Option<u16> {
    match name.as_bytes() {
        [a, b] => Some(u16::from_be_bytes([*a, *b])),
        _ => None,
    }
}

/// Match `name` against a filter where `+` stands for one level and a trailing `#` for any
/// number of levels, including none.
pub fn topic_matches(filter: &str, name: &str) -> bool {
    let mut levels = name.split('/');
    let mut filters = filter.split('/').peekable();
    while let Some(part) = filters.next() {
        if part == "#" && filters.peek().is_none() {
            return true;
        }
        match levels.next() {
            Some(level) if part == "+" || part == level => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}

/// Insertion ordered topic table with a name index for exact lookups.
#[derive(Default, Debug)]
pub struct TopicRegistry {
    entries: Vec<TopicEntry>,
    by_name: HashMap<String, usize>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopicEntry> {
        self.entries.iter()
    }

    /// Add a topic or update the existing entry with the same name (or id for nameless
    /// entries). A `None` handler keeps the current one.
    pub fn add(
        &mut self,
        name: &str,
        id: u16,
        topic_type: TopicType,
        handler: Option<Handler>,
    ) -> &TopicEntry {
        let existing = if name.is_empty() {
            self.entries
                .iter()
                .position(|e| e.name.is_empty() && e.id == id && e.topic_type == topic_type)
        } else {
            self.by_name.get(name).copied()
        };
        let index = match existing {
            Some(index) => {
                let entry = &mut self.entries[index];
                if id != 0 {
                    entry.id = id;
                    entry.topic_type = topic_type;
                }
                if handler.is_some() {
                    entry.handler = handler;
                }
                index
            }
            None => {
                self.entries.push(TopicEntry {
                    name: name.to_owned(),
                    id,
                    topic_type,
                    handler,
                });
                let index = self.entries.len() - 1;
                if !name.is_empty() {
                    self.by_name.insert(name.to_owned(), index);
                }
                index
            }
        };
        &self.entries[index]
    }

    pub fn get_by_name(&self, name: &str) -> Option<&TopicEntry> {
        self.by_name.get(name).map(|i| &self.entries[*i])
    }

    pub fn get_by_id(&self, id: u16, topic_type: TopicType) -> Option<&TopicEntry> {
        self.entries
            .iter()
            .find(|e| e.id == id && e.topic_type == topic_type && id != 0)
    }

    /// Cached id of a named topic, 0 when unknown or not registered yet.
    pub fn id_of(&self, name: &str) -> u16 {
        self.get_by_name(name).map_or(0, |e| e.id)
    }

    /// Record the id the gateway assigned to `name`. Returns false for unknown names.
    pub fn set_id(&mut self, name: &str, id: u16, topic_type: TopicType) -> bool {
        match self.by_name.get(name) {
            Some(index) => {
                let entry = &mut self.entries[*index];
                entry.id = id;
                entry.topic_type = topic_type;
                true
            }
            None => false,
        }
    }

    /// First entry, in registration order, whose name or filter matches `name`.
    pub fn find_match(&self, name: &str) -> Option<&TopicEntry> {
        self.entries
            .iter()
            .find(|e| !e.name.is_empty() && topic_matches(&e.name, name))
    }

    pub fn remove_by_name(&mut self, name: &str) -> Option<TopicEntry> {
        let index = self.by_name.get(name).copied()?;
        Some(self.remove_at(index))
    }

    pub fn remove_by_id(&mut self, id: u16, topic_type: TopicType) -> Option<TopicEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id && e.topic_type == topic_type)?;
        Some(self.remove_at(index))
    }

    fn remove_at(&mut self, index: usize) -> TopicEntry {
        let entry = self.entries.remove(index);
        self.reindex();
        entry
    }

    fn reindex(&mut self) {
        self.by_name = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.name.is_empty())
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_name.clear();
    }
}
