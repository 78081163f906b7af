// ============================================================================
// src/error.rs - Driver Error Types
// ============================================================================
//!
//! # ドライバエラー型
//!
//! 全ての失敗しうる操作は`Result<_, NvmeError>`を返す。コンポーネント境界を
//! 越えるパニックは存在しない。リトライはどの層でも行わない（1呼び出し
//! 1試行）。

use crate::defs::NvmeStatus;

/// NVMeドライバエラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeError {
    /// コントローラ無効化がタイムアウト（CSTS.RDYがクリアされない）
    ResetTimeout,
    /// コントローラ有効化がタイムアウト（CSTS.RDYがセットされない）
    EnableTimeout,
    /// CSTS.CFS（致命的ステータス）を検出
    FatalControllerStatus,
    /// Submission Queueがフル
    QueueFull,
    /// コマンド完了待ちがタイムアウト
    CommandTimeout,
    /// コントローラがエラーステータスを返した
    CommandStatusError {
        /// デコード済みステータス
        status: NvmeStatus,
        /// ワイヤ上のステータスフィールド（フェーズビット除去済み）
        code: u16,
    },
    /// ネームスペースが存在しないか非アクティブ
    InvalidNamespace,
    /// LBA範囲がネームスペースサイズを超過
    OutOfRangeAccess,
    /// 転送長がコントローラの最大転送サイズを超過
    TransferTooLarge,
    /// DMAバッファ割り当て失敗
    AllocationFailure,
    /// 無効なパラメータ
    InvalidParameter(&'static str),
    /// コントローラがReady状態ではない
    NotReady,
}

impl NvmeError {
    /// CQEのstatusフィールドからコマンドエラーを作成
    pub fn from_completion_status(status: u16) -> Self {
        NvmeError::CommandStatusError {
            status: NvmeStatus::from_wire(status),
            code: status >> 1,
        }
    }
}

impl core::fmt::Display for NvmeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NvmeError::ResetTimeout => write!(f, "controller disable timeout"),
            NvmeError::EnableTimeout => write!(f, "controller enable timeout"),
            NvmeError::FatalControllerStatus => write!(f, "controller fatal status (CSTS.CFS)"),
            NvmeError::QueueFull => write!(f, "submission queue full"),
            NvmeError::CommandTimeout => write!(f, "command completion timeout"),
            NvmeError::CommandStatusError { status, code } => {
                write!(f, "command failed: {:?} (code 0x{:03x})", status, code)
            }
            NvmeError::InvalidNamespace => write!(f, "namespace not found or inactive"),
            NvmeError::OutOfRangeAccess => write!(f, "access beyond end of namespace"),
            NvmeError::TransferTooLarge => write!(f, "transfer exceeds controller limit"),
            NvmeError::AllocationFailure => write!(f, "DMA buffer allocation failed"),
            NvmeError::InvalidParameter(what) => write!(f, "invalid parameter: {}", what),
            NvmeError::NotReady => write!(f, "controller not ready"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
