use anyhow::{Context, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Append-only list of clipboard texts for one client, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClipboardHistory(Vec<String>);

impl ClipboardHistory {
    pub fn push(&mut self, text: impl Into<String>) {
        self.0.push(text.into());
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ClipboardHistory {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub public_id: u64,
    pub name: String,
}

impl ClientIdentity {
    pub fn new(public_id: u64, name: impl Into<String>) -> Self {
        Self {
            public_id,
            name: name.into(),
        }
    }
}

/// Snapshot of one client as exchanged with peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientData {
    pub client_id: u64,
    pub client_name: String,
    #[serde(default)]
    pub text_data: ClipboardHistory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientIntroduction {
    pub secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Version of this build, sent to every client right after it binds.
    pub fn current() -> Self {
        Self {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or_default(),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or_default(),
            patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FullSync {
    pub this_host_data: ClientData,
    pub other_data: Vec<ClientData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientId {
    pub client_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Text {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TextUpdate {
    pub client_id: u64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestError {
    pub error_text: String,
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .with_context(|| format!("Failed to serialize {}", std::any::type_name::<T>()))
}

pub fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data)
        .with_context(|| format!("Failed to deserialize {}", std::any::type_name::<T>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClientData {
        ClientData {
            client_id: 1,
            client_name: "name_value".to_string(),
            text_data: ["text1", "text2"].into_iter().collect(),
        }
    }

    #[test]
    fn client_data_wire_shape() {
        let data = serialize(&sample()).unwrap();
        assert_eq!(
            std::str::from_utf8(&data).unwrap(),
            r#"{"ClientId":1,"ClientName":"name_value","TextData":["text1","text2"]}"#
        );
        let recovered: ClientData = deserialize(&data).unwrap();
        assert_eq!(recovered, sample());
    }

    #[test]
    fn missing_text_data_means_empty_history() {
        let data: ClientData = deserialize(br#"{"ClientId":4,"ClientName":"x"}"#).unwrap();
        assert!(data.text_data.is_empty());
    }

    #[test]
    fn full_sync_wire_shape() {
        let sync = FullSync {
            this_host_data: sample(),
            other_data: vec![],
        };
        let value: serde_json::Value =
            serde_json::from_slice(&serialize(&sync).unwrap()).unwrap();
        assert_eq!(value["ThisHostData"]["ClientId"], 1);
        assert_eq!(value["OtherData"], serde_json::json!([]));
    }

    #[test]
    fn introduction_and_errors() {
        let intro: ClientIntroduction = deserialize(br#"{"Secret":"s3cret"}"#).unwrap();
        assert_eq!(intro.secret, "s3cret");

        assert!(deserialize::<ClientIntroduction>(b"not json").is_err());
        assert!(deserialize::<ClientId>(br#"{"ClientId":"abc"}"#).is_err());
    }

    #[test]
    fn history_is_append_only_and_indexed() {
        let mut history = ClipboardHistory::default();
        history.push("a");
        history.push(String::from("b"));
        assert_eq!(history.len(), 2);
        assert_eq!(history.get(0), Some("a"));
        assert_eq!(history.get(1), Some("b"));
        assert_eq!(history.get(2), None);
        assert_eq!(history.iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn current_version_matches_package() {
        let version = Version::current();
        assert_eq!(
            format!("{}.{}.{}", version.major, version.minor, version.patch),
            env!("CARGO_PKG_VERSION")
        );
    }
}
