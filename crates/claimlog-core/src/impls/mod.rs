//! Impls - Substrate の実装
//!
//! - **InMemorySubstrate**: 開発用・テスト用。CAS は head カウンタで表現
//! - **GitSubstrate**: 本番用。git remote への non-forced push が CAS

pub mod git_substrate;
pub mod memory_substrate;

pub use self::git_substrate::GitSubstrate;
pub use self::memory_substrate::InMemorySubstrate;
