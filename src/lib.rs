// ============================================================================
// src/lib.rs - exostor: Polling-Mode NVMe Storage Driver
// ============================================================================
//!
//! # exostor
//!
//! ポーリング専用のNVMeストレージドライバ。コントローラのリセットから
//! 運用状態への遷移、Submission/Completionリングペアの管理、ドアベル
//! プロトコルによるコマンド発行、フェーズタグ付き完了リングの消費、
//! そしてブロッキングRead/Writeデータパスを提供する。
//!
//! 割り込みは使用しない。全ての待ちは単調クロックで制限されたビジー
//! ループであり、コントローラ（独立した並行アクタ）への唯一の同期信号は
//! ドアベル書き込みである。
//!
//! ## モジュール構成
//! - `defs`: 共通定数・オペコード・ステータス・PRP定義
//! - `error`: エラー型
//! - `time`: 単調クロック境界
//! - `mmio`: レジスタ空間トレイトとvolatile MMIO実装
//! - `dma`: ページアラインDMAバッファ
//! - `regs`: レジスタオフセットとCAP/CC/CSTS/AQAの型付きラッパ
//! - `commands`: SQE/CQE構造体とコマンドビルダ
//! - `identify`: Identifyデータ構造
//! - `namespace`: ネームスペーステーブル
//! - `queue`: リングプロトコル、ドアベル計算、完了ポーリング
//! - `pci`: PCIコンフィグ空間境界
//! - `controller`: ライフサイクル状態機械、Admin実行、データパス
//!
//! ## 使用例
//! ```ignore
//! let (_, bar0, _) = pci::probe_nvme(&mut cfg).ok_or(NvmeError::NotReady)?;
//! let regs = unsafe { Mmio::new(bar0) };
//! let mut controller = Controller::new(regs, clock);
//! controller.init()?;
//! controller.read(1, 0, 8, &mut buf)?;
//! ```

#![no_std]

extern crate alloc;

pub mod commands;
pub mod controller;
pub mod defs;
pub mod dma;
pub mod error;
pub mod identify;
pub mod mmio;
pub mod namespace;
pub mod pci;
pub mod queue;
pub mod regs;
pub mod time;

#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Re-exports - Explicit exports to avoid ambiguity
// ============================================================================

// From defs.rs - Opcodes, Status, Constants
pub use defs::{
    AdminOpcode, IdentifyCns, IoOpcode, NvmeStatus, PrpEntry, PrpList, ADMIN_QUEUE_DEPTH,
    COMMAND_TIMEOUT_MS, CONTROLLER_READY_TIMEOUT_MS, CQE_SIZE, IO_QUEUE_DEPTH, MAX_QUEUE_DEPTH,
    MAX_TRANSFER_SIZE, PAGE_SIZE, SQE_SIZE,
};

// From error.rs
pub use error::NvmeError;

// From commands.rs - Command/Completion structures
pub use commands::{Command, Completion};

// From regs.rs - Register definitions
pub use regs::{
    cc_bits, csts_bits, offsets, AdminQueueAttributes, Capabilities, ControllerConfig,
    ControllerStatus,
};

// From mmio.rs / dma.rs / time.rs - Hardware boundaries
pub use dma::DmaBuffer;
pub use mmio::{Mmio, RegisterSpace};
pub use time::{Clock, Deadline, Nanoseconds};

// From identify.rs / namespace.rs
pub use identify::{IdentifyController, IdentifyNamespace, LbaFormat};
pub use namespace::{Namespace, NamespaceTable};

// From queue.rs - Ring protocol
pub use queue::{doorbell, QueuePair};

// From pci.rs - Config space boundary
pub use pci::{ConfigSpace, PciAddress, NVME_CLASS_CODE};

// From controller.rs - Driver entry point
pub use controller::{
    Controller, ControllerIdentity, ControllerState, ControllerStats, DriverConfig,
};
