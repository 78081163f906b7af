// ============================================================================
// src/namespace.rs - Namespace Table
// ============================================================================
//!
//! Addressable logical volumes exposed by a controller.
//!
//! The table is populated during identify processing and never shrinks
//! during a session. Reads and writes validate against it before any
//! hardware access.

use hashbrown::HashMap;

use crate::identify::IdentifyNamespace;

/// ネームスペース情報
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Namespace {
    /// Namespace ID
    pub id: u32,
    /// 総論理ブロック数
    pub blocks: u64,
    /// 論理ブロックサイズ（バイト）
    pub block_size: u32,
    /// アクティブかどうか（サイズ0のネームスペースは非アクティブ）
    pub active: bool,
}

impl Namespace {
    /// Identify Namespaceデータから作成
    pub fn from_identify(nsid: u32, data: &IdentifyNamespace) -> Self {
        Self {
            id: nsid,
            blocks: data.nsze,
            block_size: data.block_size(),
            active: data.nsze > 0,
        }
    }

    /// 総容量（バイト）
    pub fn size_bytes(&self) -> u64 {
        self.blocks * self.block_size as u64
    }

    /// `[lba, lba+count)`がネームスペース内に収まるか
    pub fn contains_range(&self, lba: u64, count: u32) -> bool {
        match lba.checked_add(count as u64) {
            Some(end) => end <= self.blocks,
            None => false,
        }
    }
}

/// ネームスペーステーブル
#[derive(Default)]
pub struct NamespaceTable {
    map: HashMap<u32, Namespace>,
}

impl NamespaceTable {
    /// 空のテーブルを作成
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// ネームスペースを登録（同一IDは上書き）
    pub fn insert(&mut self, ns: Namespace) {
        self.map.insert(ns.id, ns);
    }

    /// IDで検索
    pub fn get(&self, nsid: u32) -> Option<&Namespace> {
        self.map.get(&nsid)
    }

    /// アクティブなネームスペースをIDで検索
    pub fn get_active(&self, nsid: u32) -> Option<&Namespace> {
        self.map.get(&nsid).filter(|ns| ns.active)
    }

    /// 登録数
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// 全ネームスペースを走査
    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        self.map.values()
    }
}

// ============================================================================
// Tests
// ============================================================================
