//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID
//! ID は ULID (Universally Unique Lexicographically Sortable Identifier) を使用します。
//! Phantom type パターンで共通実装を持ちつつ、マーカー型で ID の種類を区別します。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: timestamp が先頭にあるため、生成順序でソートできる
//! - **文字列表現もソート可能**: Crockford base32 なので文字列比較と順序が一致する
//! - **UUID互換**: 128-bit で UUID と同じサイズ
//!
//! 文字列表現 (`task-01J...`) がストアのキーになります。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"task-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、実行時にはメモリを消費しません。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a string is not a valid `prefix-ULID` identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("identifier '{0}' is missing the '{1}' prefix")]
    MissingPrefix(String, &'static str),

    #[error("identifier '{0}' does not contain a valid ULID")]
    InvalidUlid(String),
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(T::prefix())
            .ok_or_else(|| IdParseError::MissingPrefix(s.to_string(), T::prefix()))?;
        let ulid = Ulid::from_string(raw).map_err(|_| IdParseError::InvalidUlid(s.to_string()))?;
        Ok(Self::from_ulid(ulid))
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Identifier of a task record (unit of enqueue / status / cancel).
pub type TaskId = Id<Task>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_has_prefix() {
        let ulid = Ulid::new();
        let task = TaskId::from_ulid(ulid);
        assert_eq!(task.as_ulid(), ulid);
        assert!(task.to_string().starts_with("task-"));
    }

    #[test]
    fn parses_its_own_display() {
        let id = TaskId::from_ulid(Ulid::new());
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_foreign_strings() {
        assert!(matches!(
            "job-01ARZ3NDEKTSV4RRFFQ69G5FAV".parse::<TaskId>(),
            Err(IdParseError::MissingPrefix(_, "task-"))
        ));
        assert!(matches!(
            "task-not-a-ulid".parse::<TaskId>(),
            Err(IdParseError::InvalidUlid(_))
        ));
    }

    #[test]
    fn string_order_matches_id_order() {
        // ULID は時刻ベースなので、生成順序でソート可能
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());

        assert!(id1 < id2);
        assert!(id1.to_string() < id2.to_string());
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskId>(), size_of::<Ulid>());
    }
}
