//! Messages posted from the background worker to the main context.
//!
//! On the wire every message is a JSON object with a `type` discriminator.
//! Transfer messages (`download` / `upload`) carry a nested `data` object
//! holding the item fields and a second `type` discriminator for the phase.
//! Batch messages (`shareProgress` / `publicLinkProgress`) are flat.
//!
//! `progress.bytes` is a delta: the consumer accumulates it.
//! `directoryProgress.created` is the number of sub-entries created so far.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::DecodeError;

/// A worker message in its JSON form.
pub type Message = Value;

pub const TYPE_DOWNLOAD: &str = "download";
pub const TYPE_UPLOAD: &str = "upload";
pub const TYPE_SHARE_PROGRESS: &str = "shareProgress";
pub const TYPE_PUBLIC_LINK_PROGRESS: &str = "publicLinkProgress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferKind {
    Download,
    Upload,
}

impl TransferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => TYPE_DOWNLOAD,
            Self::Upload => TYPE_UPLOAD,
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileType {
    File,
    Directory,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "directory" => Some(Self::Directory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferItem {
    pub uuid: String,
    pub name: String,
    pub file_type: FileType,
}

impl TransferItem {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>, file_type: FileType) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            file_type,
        }
    }
}

/// The cause attached to an `error` phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailure {
    pub name: String,
    pub message: String,
}

impl TransferFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPhase {
    Started { size: u64 },
    Queued,
    Finished { size: u64 },
    Progress { bytes: u64 },
    DirectoryProgress { created: u64 },
    Error { err: TransferFailure, size: u64 },
    Stopped { size: u64 },
    Paused,
    Resumed,
}

impl TransferPhase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Self::Started { .. } => PhaseKind::Started,
            Self::Queued => PhaseKind::Queued,
            Self::Finished { .. } => PhaseKind::Finished,
            Self::Progress { .. } => PhaseKind::Progress,
            Self::DirectoryProgress { .. } => PhaseKind::DirectoryProgress,
            Self::Error { .. } => PhaseKind::Error,
            Self::Stopped { .. } => PhaseKind::Stopped,
            Self::Paused => PhaseKind::Paused,
            Self::Resumed => PhaseKind::Resumed,
        }
    }
}

/// Payload-free phase discriminator, used as a dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PhaseKind {
    Started,
    Queued,
    Finished,
    Progress,
    DirectoryProgress,
    Error,
    Stopped,
    Paused,
    Resumed,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 9] = [
        Self::Started,
        Self::Queued,
        Self::Finished,
        Self::Progress,
        Self::DirectoryProgress,
        Self::Error,
        Self::Stopped,
        Self::Paused,
        Self::Resumed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Queued => "queued",
            Self::Finished => "finished",
            Self::Progress => "progress",
            Self::DirectoryProgress => "directoryProgress",
            Self::Error => "error",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Stopped)
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub kind: TransferKind,
    pub item: TransferItem,
    pub phase: TransferPhase,
}

impl TransferEvent {
    pub fn new(kind: TransferKind, item: TransferItem, phase: TransferPhase) -> Self {
        Self { kind, item, phase }
    }
}

/// Identifies the operation a batch progress message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BatchKey {
    Share {
        #[serde(rename = "requestUUID")]
        request_uuid: String,
    },
    PublicLink { uuid: String },
}

impl BatchKey {
    pub fn id(&self) -> &str {
        match self {
            Self::Share { request_uuid } => request_uuid,
            Self::PublicLink { uuid } => uuid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgressEvent {
    pub key: BatchKey,
    pub done: u64,
    pub total: u64,
}

impl BatchProgressEvent {
    /// Returns `None` unless `done <= total`.
    pub fn new(key: BatchKey, done: u64, total: u64) -> Option<Self> {
        (done <= total).then_some(Self { key, done, total })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Transfer(TransferEvent),
    Batch(BatchProgressEvent),
}

impl Event {
    pub fn route(&self) -> Route {
        match self {
            Self::Transfer(t) => Route::transfer(t.kind, t.phase.kind()),
            Self::Batch(b) => match b.key {
                BatchKey::Share { .. } => Route::share_progress(),
                BatchKey::PublicLink { .. } => Route::public_link_progress(),
            },
        }
    }
}

impl From<TransferEvent> for Event {
    fn from(value: TransferEvent) -> Self {
        Self::Transfer(value)
    }
}

impl From<BatchProgressEvent> for Event {
    fn from(value: BatchProgressEvent) -> Self {
        Self::Batch(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Download,
    Upload,
    ShareProgress,
    PublicLinkProgress,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => TYPE_DOWNLOAD,
            Self::Upload => TYPE_UPLOAD,
            Self::ShareProgress => TYPE_SHARE_PROGRESS,
            Self::PublicLinkProgress => TYPE_PUBLIC_LINK_PROGRESS,
        }
    }
}

impl From<TransferKind> for MessageKind {
    fn from(value: TransferKind) -> Self {
        match value {
            TransferKind::Download => Self::Download,
            TransferKind::Upload => Self::Upload,
        }
    }
}

/// `(kind, phase)` pair a handler is registered for. Batch messages have no
/// phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    pub kind: MessageKind,
    pub phase: Option<PhaseKind>,
}

impl Route {
    pub fn transfer(kind: TransferKind, phase: PhaseKind) -> Self {
        Self {
            kind: kind.into(),
            phase: Some(phase),
        }
    }

    pub fn share_progress() -> Self {
        Self {
            kind: MessageKind::ShareProgress,
            phase: None,
        }
    }

    pub fn public_link_progress() -> Self {
        Self {
            kind: MessageKind::PublicLinkProgress,
            phase: None,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            Some(phase) => write!(f, "{}.{}", self.kind.as_str(), phase),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

pub fn encode(event: &Event) -> Message {
    match event {
        Event::Transfer(t) => encode_transfer(t),
        Event::Batch(b) => encode_batch(b),
    }
}

pub fn encode_transfer(event: &TransferEvent) -> Message {
    let mut data = Map::new();
    data.insert("uuid".into(), json!(event.item.uuid));
    data.insert("name".into(), json!(event.item.name));
    data.insert("fileType".into(), json!(event.item.file_type.as_str()));
    data.insert("type".into(), json!(event.phase.kind().as_str()));

    match &event.phase {
        TransferPhase::Started { size }
        | TransferPhase::Finished { size }
        | TransferPhase::Stopped { size } => {
            data.insert("size".into(), json!(size));
        }
        TransferPhase::Progress { bytes } => {
            data.insert("bytes".into(), json!(bytes));
        }
        TransferPhase::DirectoryProgress { created } => {
            data.insert("created".into(), json!(created));
        }
        TransferPhase::Error { err, size } => {
            data.insert("err".into(), json!({ "name": err.name, "message": err.message }));
            data.insert("size".into(), json!(size));
        }
        TransferPhase::Queued | TransferPhase::Paused | TransferPhase::Resumed => {}
    }

    json!({ "type": event.kind.as_str(), "data": Value::Object(data) })
}

pub fn encode_batch(event: &BatchProgressEvent) -> Message {
    match &event.key {
        BatchKey::Share { request_uuid } => json!({
            "type": TYPE_SHARE_PROGRESS,
            "done": event.done,
            "total": event.total,
            "requestUUID": request_uuid,
        }),
        BatchKey::PublicLink { uuid } => json!({
            "type": TYPE_PUBLIC_LINK_PROGRESS,
            "done": event.done,
            "total": event.total,
            "uuid": uuid,
        }),
    }
}

/// One NDJSON line, without the trailing newline.
pub fn encode_line(event: &Event) -> String {
    encode(event).to_string()
}

pub fn decode(message: &Message) -> Result<Event, DecodeError> {
    let obj = message.as_object().ok_or_else(|| DecodeError::Malformed {
        message: "message is not a JSON object".to_string(),
    })?;

    let tag = obj.get("type").and_then(Value::as_str);
    match tag {
        Some(TYPE_DOWNLOAD) => decode_transfer(TransferKind::Download, obj).map(Event::Transfer),
        Some(TYPE_UPLOAD) => decode_transfer(TransferKind::Upload, obj).map(Event::Transfer),
        Some(TYPE_SHARE_PROGRESS) => {
            let request_uuid = required_str(obj, "requestUUID")?;
            decode_batch(BatchKey::Share { request_uuid }, obj).map(Event::Batch)
        }
        Some(TYPE_PUBLIC_LINK_PROGRESS) => {
            let uuid = required_str(obj, "uuid")?;
            decode_batch(BatchKey::PublicLink { uuid }, obj).map(Event::Batch)
        }
        other => Err(DecodeError::UnknownType {
            scope: "message",
            tag: other.map(str::to_string),
        }),
    }
}

pub fn decode_str(line: &str) -> Result<Event, DecodeError> {
    let message: Message = serde_json::from_str(line).map_err(|e| DecodeError::Malformed {
        message: e.to_string(),
    })?;
    decode(&message)
}

fn decode_transfer(
    kind: TransferKind,
    obj: &Map<String, Value>,
) -> Result<TransferEvent, DecodeError> {
    let data = match obj.get("data") {
        Some(Value::Object(data)) => data,
        Some(_) => {
            return Err(DecodeError::InvalidField {
                field: "data",
                reason: "expected an object".to_string(),
            });
        }
        None => return Err(DecodeError::MissingField { field: "data" }),
    };

    // The phase discriminator is checked first so an unknown phase from a
    // newer producer is reported as such, whatever its payload looks like.
    let phase_tag = data.get("type").and_then(Value::as_str);
    let phase_kind = phase_tag
        .and_then(PhaseKind::parse)
        .ok_or_else(|| DecodeError::UnknownType {
            scope: "phase",
            tag: phase_tag.map(str::to_string),
        })?;

    let file_type_raw = required_str(data, "fileType")?;
    let file_type = FileType::parse(&file_type_raw).ok_or_else(|| DecodeError::InvalidField {
        field: "fileType",
        reason: format!("expected \"file\" or \"directory\", got {file_type_raw:?}"),
    })?;
    let item = TransferItem {
        uuid: required_str(data, "uuid")?,
        name: required_str(data, "name")?,
        file_type,
    };

    let phase = match phase_kind {
        PhaseKind::Started => TransferPhase::Started {
            size: required_u64(data, "size")?,
        },
        PhaseKind::Queued => TransferPhase::Queued,
        PhaseKind::Finished => TransferPhase::Finished {
            size: required_u64(data, "size")?,
        },
        PhaseKind::Progress => TransferPhase::Progress {
            bytes: required_u64(data, "bytes")?,
        },
        PhaseKind::DirectoryProgress => TransferPhase::DirectoryProgress {
            created: required_u64(data, "created")?,
        },
        PhaseKind::Error => TransferPhase::Error {
            err: required_failure(data)?,
            size: required_u64(data, "size")?,
        },
        PhaseKind::Stopped => TransferPhase::Stopped {
            size: required_u64(data, "size")?,
        },
        PhaseKind::Paused => TransferPhase::Paused,
        PhaseKind::Resumed => TransferPhase::Resumed,
    };

    Ok(TransferEvent { kind, item, phase })
}

fn decode_batch(key: BatchKey, obj: &Map<String, Value>) -> Result<BatchProgressEvent, DecodeError> {
    let done = required_u64(obj, "done")?;
    let total = required_u64(obj, "total")?;
    BatchProgressEvent::new(key, done, total).ok_or_else(|| DecodeError::InvalidField {
        field: "done",
        reason: format!("done ({done}) exceeds total ({total})"),
    })
}

fn required_str(obj: &Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(DecodeError::InvalidField {
            field,
            reason: format!("expected a string, got {other}"),
        }),
        None => Err(DecodeError::MissingField { field }),
    }
}

fn required_u64(obj: &Map<String, Value>, field: &'static str) -> Result<u64, DecodeError> {
    match obj.get(field) {
        Some(v) => v.as_u64().ok_or_else(|| DecodeError::InvalidField {
            field,
            reason: format!("expected a non-negative integer, got {v}"),
        }),
        None => Err(DecodeError::MissingField { field }),
    }
}

fn required_failure(obj: &Map<String, Value>) -> Result<TransferFailure, DecodeError> {
    match obj.get("err") {
        Some(Value::String(message)) => Ok(TransferFailure::new(message.clone())),
        Some(Value::Object(err)) => {
            let message = required_str(err, "message")?;
            let name = match err.get("name") {
                Some(Value::String(name)) => name.clone(),
                _ => "Error".to_string(),
            };
            Ok(TransferFailure { name, message })
        }
        Some(other) => Err(DecodeError::InvalidField {
            field: "err",
            reason: format!("expected an object or a string, got {other}"),
        }),
        None => Err(DecodeError::MissingField { field: "err" }),
    }
}

/// Whether a message may be dropped under backpressure: only byte deltas
/// qualify, every lifecycle message must be delivered.
pub fn is_droppable(message: &Message) -> bool {
    let outer = message.get("type").and_then(Value::as_str);
    if !matches!(outer, Some(TYPE_DOWNLOAD) | Some(TYPE_UPLOAD)) {
        return false;
    }
    message
        .get("data")
        .and_then(|d| d.get("type"))
        .and_then(Value::as_str)
        == Some(PhaseKind::Progress.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(file_type: FileType) -> TransferItem {
        TransferItem::new("4f1d2c3a-0000-4000-8000-000000000001", "report.pdf", file_type)
    }

    fn every_phase() -> Vec<TransferPhase> {
        vec![
            TransferPhase::Started { size: 100 },
            TransferPhase::Queued,
            TransferPhase::Finished { size: 100 },
            TransferPhase::Progress { bytes: 30 },
            TransferPhase::DirectoryProgress { created: 7 },
            TransferPhase::Error {
                err: TransferFailure {
                    name: "TypeError".to_string(),
                    message: "network down".to_string(),
                },
                size: 42,
            },
            TransferPhase::Stopped { size: 10 },
            TransferPhase::Paused,
            TransferPhase::Resumed,
        ]
    }

    #[test]
    fn decode_inverts_encode_for_every_event_shape() {
        let mut events: Vec<Event> = Vec::new();
        for kind in [TransferKind::Download, TransferKind::Upload] {
            for file_type in [FileType::File, FileType::Directory] {
                for phase in every_phase() {
                    events.push(TransferEvent::new(kind, item(file_type), phase).into());
                }
            }
        }
        events.push(
            BatchProgressEvent::new(
                BatchKey::Share {
                    request_uuid: "req-1".to_string(),
                },
                3,
                10,
            )
            .unwrap()
            .into(),
        );
        events.push(
            BatchProgressEvent::new(
                BatchKey::PublicLink {
                    uuid: "link-1".to_string(),
                },
                0,
                0,
            )
            .unwrap()
            .into(),
        );

        for event in events {
            let decoded = decode(&encode(&event)).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn encodes_transfer_with_nested_phase_discriminator() {
        let event = Event::Transfer(TransferEvent::new(
            TransferKind::Upload,
            item(FileType::File),
            TransferPhase::Progress { bytes: 4096 },
        ));
        let v = encode(&event);
        assert_eq!(v["type"], "upload");
        assert_eq!(v["data"]["type"], "progress");
        assert_eq!(v["data"]["bytes"], 4096);
        assert_eq!(v["data"]["fileType"], "file");
        assert!(v["data"].get("size").is_none());
    }

    #[test]
    fn encodes_share_progress_with_request_uuid_field() {
        let event = Event::Batch(
            BatchProgressEvent::new(
                BatchKey::Share {
                    request_uuid: "req-9".to_string(),
                },
                5,
                10,
            )
            .unwrap(),
        );
        let v = encode(&event);
        assert_eq!(v["type"], "shareProgress");
        assert_eq!(v["requestUUID"], "req-9");
        assert!(v.get("data").is_none());
    }

    #[test]
    fn unknown_outer_type_is_reported() {
        let err = decode_str(r#"{"type":"thumbnailProgress","done":1}"#).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownType {
                scope: "message",
                tag: Some("thumbnailProgress".to_string()),
            }
        );
    }

    #[test]
    fn missing_outer_type_is_unknown_type() {
        let err = decode_str(r#"{"done":1,"total":2}"#).unwrap_err();
        assert!(err.is_unknown_type());
    }

    #[test]
    fn unknown_phase_is_reported_before_payload_checks() {
        let err = decode_str(r#"{"type":"download","data":{"type":"verifying"}}"#).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownType {
                scope: "phase",
                tag: Some("verifying".to_string()),
            }
        );
    }

    #[test]
    fn missing_phase_payload_is_missing_field() {
        let err = decode_str(
            r#"{"type":"upload","data":{"uuid":"u","name":"n","fileType":"file","type":"started"}}"#,
        )
        .unwrap_err();
        assert_eq!(err, DecodeError::MissingField { field: "size" });

        let err = decode_str(
            r#"{"type":"upload","data":{"uuid":"u","name":"n","fileType":"file","type":"error","size":1}}"#,
        )
        .unwrap_err();
        assert_eq!(err, DecodeError::MissingField { field: "err" });
    }

    #[test]
    fn missing_item_field_is_missing_field() {
        let err =
            decode_str(r#"{"type":"upload","data":{"name":"n","fileType":"file","type":"queued"}}"#)
                .unwrap_err();
        assert_eq!(err, DecodeError::MissingField { field: "uuid" });
    }

    #[test]
    fn negative_or_fractional_sizes_are_invalid() {
        let err = decode_str(
            r#"{"type":"upload","data":{"uuid":"u","name":"n","fileType":"file","type":"progress","bytes":-1}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "bytes", .. }));

        let err = decode_str(
            r#"{"type":"upload","data":{"uuid":"u","name":"n","fileType":"file","type":"progress","bytes":1.5}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "bytes", .. }));
    }

    #[test]
    fn batch_done_above_total_is_invalid() {
        let err = decode_str(r#"{"type":"publicLinkProgress","done":11,"total":10,"uuid":"l"}"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "done", .. }));
    }

    #[test]
    fn error_cause_accepts_bare_string() {
        let event = decode_str(
            r#"{"type":"download","data":{"uuid":"u","name":"n","fileType":"file","type":"error","err":"boom","size":3}}"#,
        )
        .unwrap();
        let Event::Transfer(t) = event else {
            panic!("expected transfer");
        };
        assert_eq!(
            t.phase,
            TransferPhase::Error {
                err: TransferFailure::new("boom"),
                size: 3,
            }
        );
    }

    #[test]
    fn non_object_and_invalid_json_are_malformed() {
        assert!(matches!(decode_str("[1,2]"), Err(DecodeError::Malformed { .. })));
        assert!(matches!(decode_str("{not json"), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn only_transfer_progress_is_droppable() {
        let progress = encode(&Event::Transfer(TransferEvent::new(
            TransferKind::Download,
            item(FileType::File),
            TransferPhase::Progress { bytes: 1 },
        )));
        let finished = encode(&Event::Transfer(TransferEvent::new(
            TransferKind::Download,
            item(FileType::File),
            TransferPhase::Finished { size: 1 },
        )));
        assert!(is_droppable(&progress));
        assert!(!is_droppable(&finished));
        assert!(!is_droppable(&json!({"type": "shareProgress", "done": 0, "total": 1, "requestUUID": "r"})));
    }
}
