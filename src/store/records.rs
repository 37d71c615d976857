//! Record collections that survive entries they cannot read.
//!
//! Each entry of a [`Records`] document is converted on its own. An entry
//! that does not fit the record type is kept as raw JSON and written back
//! after the readable ones, so one hand-edited field never costs the rest of
//! the file. Timestamp fields get the same treatment at field level: a value
//! that does not parse reads as unset, and the original value is written back
//! until the field is set again.

use serde::de::{DeserializeOwned, Deserializer};
use serde::ser::{Error as _, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::{Deref, DerefMut};
use tracing::warn;

/// One entry of a [`Records`] collection.
///
/// Implementors keep unknown keys in a flattened map declared before their
/// timestamp fields, and skip those fields when unset. A set field then
/// replaces a kept raw value of the same name on write.
pub trait Record: Serialize + DeserializeOwned {
    /// Names of the fields stored with [`super::timestamp::optional`].
    const TIMESTAMPS: &'static [&'static str] = &[];

    fn extra_mut(&mut self) -> &mut Map<String, Value>;
}

#[derive(Debug, Clone)]
pub struct Records<R> {
    items: Vec<R>,
    unreadable: Vec<Value>,
}

impl<R> Default for Records<R> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            unreadable: Vec::new(),
        }
    }
}

impl<R> Records<R> {
    pub fn into_vec(self) -> Vec<R> {
        self.items
    }

    /// Entries that did not fit the record type, as they were read.
    pub fn unreadable(&self) -> &[Value] {
        &self.unreadable
    }
}

impl<R> From<Vec<R>> for Records<R> {
    fn from(items: Vec<R>) -> Self {
        Self {
            items,
            unreadable: Vec::new(),
        }
    }
}

impl<R> Deref for Records<R> {
    type Target = Vec<R>;

    fn deref(&self) -> &Vec<R> {
        &self.items
    }
}

impl<R> DerefMut for Records<R> {
    fn deref_mut(&mut self) -> &mut Vec<R> {
        &mut self.items
    }
}

fn read_record<R: Record>(value: &Value) -> serde_json::Result<R> {
    let mut record = R::deserialize(value)?;
    if let Value::Object(fields) = value {
        for name in R::TIMESTAMPS {
            match fields.get(*name) {
                None | Some(Value::Null) => {}
                Some(Value::String(s)) if super::timestamp::parse(s).is_some() => {}
                Some(raw) => {
                    record.extra_mut().insert((*name).to_string(), raw.clone());
                }
            }
        }
    }
    Ok(record)
}

impl<'de, R: Record> Deserialize<'de> for Records<R> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries = Vec::<Value>::deserialize(deserializer)?;
        let mut records = Self::default();
        for entry in entries {
            match read_record(&entry) {
                Ok(record) => records.items.push(record),
                Err(e) => {
                    warn!("Keeping unreadable record as-is: {}", e);
                    records.unreadable.push(entry);
                }
            }
        }
        Ok(records)
    }
}

impl<R: Record> Serialize for Records<R> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.items.len() + self.unreadable.len()))?;
        for item in &self.items {
            // Going through a map lets later keys win over kept raw values.
            let value = serde_json::to_value(item).map_err(S::Error::custom)?;
            seq.serialize_element(&value)?;
        }
        for entry in &self.unreadable {
            seq.serialize_element(entry)?;
        }
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{timestamp, JsonFile};
    use chrono::NaiveDateTime;
    use serde_json::json;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Note {
        #[serde(flatten)]
        extra: Map<String, Value>,
        #[serde(default)]
        id: String,
        #[serde(default)]
        pinned: bool,
        #[serde(
            default,
            with = "timestamp::optional",
            skip_serializing_if = "Option::is_none"
        )]
        at: Option<NaiveDateTime>,
    }

    impl Record for Note {
        const TIMESTAMPS: &'static [&'static str] = &["at"];

        fn extra_mut(&mut self) -> &mut Map<String, Value> {
            &mut self.extra
        }
    }

    fn stored(file: &JsonFile<Records<Note>>) -> Value {
        serde_json::from_slice(&std::fs::read(file.path()).unwrap()).unwrap()
    }

    #[test]
    fn mistyped_entry_survives_a_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let file: JsonFile<Records<Note>> = JsonFile::new(dir.path().join("notes.json"));
        std::fs::write(
            file.path(),
            r#"[{"id":"a","pinned":true},{"id":"b","pinned":"yes"}]"#,
        )
        .unwrap();

        let loaded = file.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.unreadable().len(), 1);

        file.update(|notes| {
            notes.push(Note {
                id: "c".into(),
                ..Note::default()
            })
        })
        .unwrap();

        let raw = stored(&file);
        let entries = raw.as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.contains(&json!({"id": "b", "pinned": "yes"})));
        assert!(!dir.path().join("notes.json.corrupt").exists());
    }

    #[test]
    fn unparsable_timestamp_is_written_back_until_set() {
        let dir = tempfile::tempdir().unwrap();
        let file: JsonFile<Records<Note>> = JsonFile::new(dir.path().join("notes.json"));
        std::fs::write(
            file.path(),
            r#"[{"id":"a","at":"next friday"},{"id":"b","at":42}]"#,
        )
        .unwrap();

        let loaded = file.load();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|n| n.at.is_none()));

        file.update(|notes| notes[1].pinned = true).unwrap();
        let raw = stored(&file);
        assert_eq!(raw[0]["at"], "next friday");
        assert_eq!(raw[1]["at"], 42);

        let when = timestamp::parse("2024-03-01T09:00:00").unwrap();
        file.update(|notes| notes[0].at = Some(when)).unwrap();
        assert_eq!(stored(&file)[0]["at"], "2024-03-01T09:00:00");
        assert_eq!(file.load()[0].at, Some(when));
    }
}
