use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

use crate::store::{timestamp, JsonFile, Record, Records};

const STOP_WORDS: &[&str] = &[
    "the", "is", "it", "to", "and", "of", "in", "for", "on", "with", "this", "that", "are", "was",
    "not", "but", "what", "how", "can", "about", "from", "have", "will", "would", "should",
    "could", "there", "their", "they", "them", "then", "than", "when", "where", "which", "your",
    "yours", "into", "just", "like", "some", "more", "also", "been", "were", "does", "please",
];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unknown keys, plus timestamp values that did not parse.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(
        default,
        with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub created: Option<NaiveDateTime>,
}

impl Record for MemoryItem {
    const TIMESTAMPS: &'static [&'static str] = &["created"];

    fn extra_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.extra
    }
}

static WORDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("word regex should compile"));

/// Words longer than three characters that are not stop words, lowercased.
pub fn keywords(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    WORDS
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|w| w.chars().count() > 3 && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Formats the recall block prepended to a new session's prompt. Entries
/// that would push the block past `max_chars` are left out.
fn context_block(items: &[MemoryItem], max_chars: usize) -> Option<String> {
    let mut lines = vec!["[Memory context]".to_string()];
    let mut total = 0;
    for item in items {
        let entry = format!("- {}", item.text);
        total += entry.chars().count();
        if total > max_chars {
            break;
        }
        lines.push(entry);
    }
    if lines.len() == 1 {
        return None;
    }
    Some(lines.join("\n"))
}

/// Long-term notes the agent can save and search, kept in `memory.json`.
#[derive(Debug, Clone)]
pub struct Memory {
    file: JsonFile<Records<MemoryItem>>,
}

impl Memory {
    pub fn new(file: JsonFile<Records<MemoryItem>>) -> Self {
        Self { file }
    }

    pub fn list(&self) -> Vec<MemoryItem> {
        self.file.load().into_vec()
    }

    pub fn add(&self, text: &str) -> Result<MemoryItem> {
        if text.trim().is_empty() {
            return Err(anyhow!("Memory text must not be empty"));
        }
        let item = MemoryItem {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            created: Some(timestamp::now()),
            extra: Map::new(),
        };
        let stored = item.clone();
        self.file.update(move |items| items.push(stored))?;
        Ok(item)
    }

    /// Case-insensitive substring search.
    pub fn search(&self, query: &str) -> Vec<MemoryItem> {
        let query = query.to_lowercase();
        self.file
            .load()
            .into_vec()
            .into_iter()
            .filter(|item| item.text.to_lowercase().contains(&query))
            .collect()
    }

    pub fn forget(&self, id: &str) -> Result<()> {
        let removed = self.file.update_if_changed(|items| {
            let before = items.len();
            items.retain(|i| i.id != id);
            let removed = items.len() != before;
            (removed, removed)
        })?;
        if !removed {
            return Err(anyhow!("Memory item not found: {}", id));
        }
        Ok(())
    }

    /// Items relevant to `prompt`, as a context block ready to prepend.
    pub fn recall(&self, prompt: &str, max_results: usize, max_chars: usize) -> Option<String> {
        let keywords = keywords(prompt);
        if keywords.is_empty() || max_results == 0 {
            return None;
        }
        let items = self.file.load();

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        'outer: for keyword in &keywords {
            for (idx, item) in items.iter().enumerate() {
                if seen.contains(&idx) || !item.text.to_lowercase().contains(keyword.as_str()) {
                    continue;
                }
                seen.insert(idx);
                found.push(item.clone());
                if found.len() >= max_results {
                    break 'outer;
                }
            }
        }
        context_block(&found, max_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> (tempfile::TempDir, Memory) {
        let dir = tempfile::tempdir().unwrap();
        let memory = Memory::new(JsonFile::new(dir.path().join("memory.json")));
        (dir, memory)
    }

    #[test]
    fn keywords_skip_short_and_stop_words() {
        let words = keywords("What about the Dentist appointment on Friday? It is with Dr. Novak");
        let expected: BTreeSet<String> = ["dentist", "appointment", "friday", "novak"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(words, expected);
    }

    #[test]
    fn crud_and_search() {
        let (_dir, memory) = memory();
        let item = memory.add("Wife's birthday is on 14 May").unwrap();
        memory.add("Prefers window seats").unwrap();
        assert_eq!(memory.search("BIRTHDAY").len(), 1);
        assert_eq!(memory.list().len(), 2);
        memory.forget(&item.id).unwrap();
        assert!(memory.search("birthday").is_empty());
        assert!(memory.forget(&item.id).is_err());
    }

    #[test]
    fn recall_collects_each_item_once() {
        let (_dir, memory) = memory();
        memory.add("Dentist is Dr. Novak, Friday mornings only").unwrap();
        memory.add("Car service due in March").unwrap();

        let block = memory
            .recall("Book the dentist for Friday", 10, 2000)
            .unwrap();
        assert_eq!(
            block,
            "[Memory context]\n- Dentist is Dr. Novak, Friday mornings only"
        );
        assert!(memory.recall("hello there", 10, 2000).is_none());
    }

    #[test]
    fn recall_respects_limits() {
        let (_dir, memory) = memory();
        for i in 0..5 {
            memory.add(&format!("project alpha note {}", i)).unwrap();
        }
        let block = memory.recall("alpha", 3, 2000).unwrap();
        assert_eq!(block.lines().count(), 4);

        let tight = memory.recall("alpha", 10, 45).unwrap();
        assert_eq!(tight.lines().count(), 3);
    }
}
