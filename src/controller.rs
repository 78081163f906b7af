// ============================================================================
// src/controller.rs - NVMe Controller Lifecycle, Admin and Data Path
// ============================================================================
//!
//! # NVMeコントローラ
//!
//! リセットから運用状態までのコントローラライフサイクル、Adminコマンドの
//! 逐次実行（Identify、I/Oキュー作成）、およびブロッキングRead/Write
//! データパスを提供する。
//!
//! 設計は協調的シングルスレッド・ポーリング専用。コントローラ自体が
//! 唯一の並行アクタであり、ドアベル書き込みだけが境界を越える同期信号に
//! なる。`Controller`は呼び出し側が所有する値であり、グローバル状態は
//! 持たない。
//!
//! ## ライフサイクル
//! ```text
//! Unconfigured → Disabling → DisabledConfirmed → Configuring
//!              → Enabling → Ready
//! ```
//! タイムアウトや致命的ステータスは終端状態`Fatal`に遷移し、以後の
//! コマンド発行は全て拒否される。

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::commands::{Command, Completion};
use crate::defs::{
    PrpList, ADMIN_QUEUE_DEPTH, COMMAND_TIMEOUT_MS, CONTROLLER_READY_TIMEOUT_MS, CQE_SIZE,
    IO_QUEUE_DEPTH, MAX_QUEUE_DEPTH, MAX_TRANSFER_SIZE, PAGE_SIZE, PRP_LIST_ENTRIES, SQE_SIZE,
};
use crate::dma::DmaBuffer;
use crate::error::NvmeError;
use crate::identify::{IdentifyController, IdentifyNamespace};
use crate::mmio::RegisterSpace;
use crate::namespace::{Namespace, NamespaceTable};
use crate::queue::QueuePair;
use crate::regs::{offsets, AdminQueueAttributes, Capabilities, ControllerConfig, ControllerStatus};
use crate::time::{Clock, Deadline};

// ============================================================================
// Driver Configuration
// ============================================================================

/// ドライバ設定
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Admin Queue深度
    pub admin_queue_depth: u16,
    /// I/O Queue深度（CAP.MQES/Identifyの報告値でクランプされる）
    pub io_queue_depth: u16,
    /// 作成するI/Oキューペア数
    pub io_queue_count: u16,
    /// リセット/有効化待ちタイムアウト（未指定ならCAP.TOに従う）
    pub ready_timeout_ms: Option<u64>,
    /// コマンド完了タイムアウト
    pub command_timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            admin_queue_depth: ADMIN_QUEUE_DEPTH,
            io_queue_depth: IO_QUEUE_DEPTH,
            io_queue_count: 1,
            ready_timeout_ms: None,
            command_timeout_ms: COMMAND_TIMEOUT_MS,
        }
    }
}

// ============================================================================
// Controller State
// ============================================================================

/// コントローラライフサイクル状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// 初期状態（レジスタ未設定）
    Unconfigured,
    /// Enableビットをクリアし、RDYのクリアを待っている
    Disabling,
    /// 無効化が確認された
    DisabledConfirmed,
    /// Admin Queueとコントローラ設定を書き込んでいる
    Configuring,
    /// Enableビットをセットし、RDYのセットを待っている
    Enabling,
    /// 運用可能。コマンド発行の前提条件
    Ready,
    /// 終端状態。以後コマンドは発行されない
    Fatal,
}

// ============================================================================
// Controller Identity
// ============================================================================

/// Identify Controllerから抽出した情報
#[derive(Debug, Clone)]
pub struct ControllerIdentity {
    /// PCI Vendor ID
    pub vendor_id: u16,
    /// PCI Subsystem Vendor ID
    pub subsystem_vendor_id: u16,
    /// シリアル番号（パディング除去済み）
    pub serial: String,
    /// モデル名（パディング除去済み）
    pub model: String,
    /// ファームウェアリビジョン（パディング除去済み）
    pub firmware: String,
    /// コントローラが報告する最大キューエントリ数（0なら未報告）
    pub max_queue_entries: u16,
    /// ネームスペース数
    pub namespace_count: u32,
    /// Maximum Data Transfer Size（2^MDTSページ、0なら無制限）
    pub mdts: u8,
}

// ============================================================================
// Statistics
// ============================================================================

/// コントローラ統計
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerStats {
    /// 投入したコマンド数
    pub commands_submitted: u64,
    /// 正常完了したコマンド数
    pub commands_completed: u64,
    /// 失敗（エラーステータス/タイムアウト）したコマンド数
    pub errors: u64,
    /// 読み取りバイト数
    pub read_bytes: u64,
    /// 書き込みバイト数
    pub write_bytes: u64,
}

// ============================================================================
// Controller
// ============================================================================

/// NVMeコントローラ
///
/// 呼び出し側が所有する明示的な値。レジスタ空間とクロックを注入する
/// ことで、実ハードウェアにもテスト用モックにも同じ状態機械が載る。
pub struct Controller<S: RegisterSpace, C: Clock> {
    /// レジスタ空間
    regs: S,
    /// 単調クロック
    clock: C,
    /// ドライバ設定
    config: DriverConfig,
    /// ライフサイクル状態
    state: ControllerState,
    /// CAPレジスタのデコード結果
    caps: Capabilities,
    /// ドアベルストライド（バイト）
    stride: usize,
    /// Admin Queueペア
    admin: Option<QueuePair>,
    /// I/O Queueペア（インデックス0がI/Oキュー0 = QID 1）
    io_queues: Vec<QueuePair>,
    /// ネームスペーステーブル
    namespaces: NamespaceTable,
    /// Identify Controllerの結果
    identity: Option<ControllerIdentity>,
    /// 最大転送サイズ（バイト）
    max_transfer: usize,
    /// コントローラに通知済みで解放できないリングバッファ
    ///
    /// キュー作成が途中で失敗した場合、コントローラがackした分の
    /// リングはDMA対象であり続けるため、コントローラ寿命まで保持する。
    retained: Vec<DmaBuffer>,
    /// 統計カウンタ
    stats: ControllerStats,
}

impl<S: RegisterSpace, C: Clock> Controller<S, C> {
    /// 新しいコントローラを作成（デフォルト設定）
    pub fn new(regs: S, clock: C) -> Self {
        Self::with_config(regs, clock, DriverConfig::default())
    }

    /// 設定を指定してコントローラを作成
    pub fn with_config(regs: S, clock: C, config: DriverConfig) -> Self {
        Self {
            regs,
            clock,
            config,
            state: ControllerState::Unconfigured,
            caps: Capabilities::default(),
            stride: 4,
            admin: None,
            io_queues: Vec::new(),
            namespaces: NamespaceTable::new(),
            identity: None,
            max_transfer: MAX_TRANSFER_SIZE,
            retained: Vec::new(),
            stats: ControllerStats::default(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// 現在のライフサイクル状態
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// CAPレジスタのデコード結果
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// ドアベルストライド（バイト）
    pub fn doorbell_stride_bytes(&self) -> usize {
        self.stride
    }

    /// Identify Controllerの結果
    pub fn identity(&self) -> Option<&ControllerIdentity> {
        self.identity.as_ref()
    }

    /// ネームスペーステーブル
    pub fn namespaces(&self) -> &NamespaceTable {
        &self.namespaces
    }

    /// 作成済みI/Oキュー数
    pub fn io_queue_count(&self) -> usize {
        self.io_queues.len()
    }

    /// 最大転送サイズ（バイト）
    pub fn max_transfer_size(&self) -> usize {
        self.max_transfer
    }

    /// 統計カウンタ
    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// コントローラを初期化する
    ///
    /// リセット → 設定 → 有効化 → Identify → ネームスペース検出 →
    /// I/Oキュー作成、をこの順で実行する。途中の失敗は呼び出し側に
    /// そのまま返し、リトライはしない。ライフサイクル段階での
    /// タイムアウトは`Fatal`状態に遷移する。
    pub fn init(&mut self) -> Result<(), NvmeError> {
        if self.state != ControllerState::Unconfigured {
            return Err(NvmeError::InvalidParameter("controller already initialized"));
        }

        self.caps = Capabilities::new(self.regs.read64(offsets::CAP));
        self.stride = self.caps.doorbell_stride_bytes();
        let version = self.regs.read32(offsets::VS);
        log::info!(
            "NVMe controller: spec {}.{}, doorbell stride {} bytes, MQES {}",
            version >> 16,
            (version >> 8) & 0xFF,
            self.stride,
            self.caps.max_queue_entries()
        );

        self.disable()?;
        self.configure()?;
        self.enable()?;

        self.identify_controller()?;
        self.discover_namespaces()?;
        self.create_io_queues()?;

        log::info!(
            "NVMe controller ready: {} I/O queue(s), {} namespace(s)",
            self.io_queues.len(),
            self.namespaces.len()
        );
        Ok(())
    }

    /// リセット/有効化待ちのタイムアウト（ミリ秒）
    fn ready_timeout_ms(&self) -> u64 {
        if let Some(ms) = self.config.ready_timeout_ms {
            return ms;
        }
        let from_cap = self.caps.timeout_ms();
        if from_cap == 0 {
            CONTROLLER_READY_TIMEOUT_MS
        } else {
            from_cap
        }
    }

    /// 現在のコントローラステータスを読む
    fn status(&self) -> ControllerStatus {
        ControllerStatus::new(self.regs.read32(offsets::CSTS))
    }

    /// Unconfigured → Disabling → DisabledConfirmed
    fn disable(&mut self) -> Result<(), NvmeError> {
        self.state = ControllerState::Disabling;
        let mut cc = ControllerConfig::from_raw(self.regs.read32(offsets::CC));
        if cc.is_enabled() {
            cc.set_enable(false);
            self.regs.write32(offsets::CC, cc.raw());
        }

        let deadline = Deadline::after_ms(&self.clock, self.ready_timeout_ms());
        while self.status().ready() {
            if deadline.expired(&self.clock) {
                self.state = ControllerState::Fatal;
                log::error!("NVMe controller did not leave ready state");
                return Err(NvmeError::ResetTimeout);
            }
            core::hint::spin_loop();
        }
        self.state = ControllerState::DisabledConfirmed;
        log::debug!("NVMe controller disabled");
        Ok(())
    }

    /// DisabledConfirmed → Configuring
    ///
    /// Admin Queueメモリを確保し、AQA/ASQ/ACQと（Enableビットを除く）
    /// コントローラ設定を書き込む。
    fn configure(&mut self) -> Result<(), NvmeError> {
        self.state = ControllerState::Configuring;

        let depth = self
            .config
            .admin_queue_depth
            .min(MAX_QUEUE_DEPTH)
            .min(self.caps.max_queue_entries().min(u16::MAX as u32) as u16)
            .max(2);
        let sq_ring = DmaBuffer::new_zeroed(depth as usize * SQE_SIZE)?;
        let cq_ring = DmaBuffer::new_zeroed(depth as usize * CQE_SIZE)?;

        let mut aqa = AdminQueueAttributes::new();
        aqa.set_asqs(depth - 1).set_acqs(depth - 1);
        self.regs.write32(offsets::AQA, aqa.raw());
        self.regs.write64(offsets::ASQ, sq_ring.phys_addr());
        self.regs.write64(offsets::ACQ, cq_ring.phys_addr());

        let mut cc = ControllerConfig::new();
        cc.standard_config(self.caps.mpsmin());
        self.regs.write32(offsets::CC, cc.raw());

        self.admin = Some(QueuePair::new(0, sq_ring, cq_ring, depth, self.stride));
        log::debug!("NVMe admin queue configured (depth {})", depth);
        Ok(())
    }

    /// Configuring → Enabling → Ready
    fn enable(&mut self) -> Result<(), NvmeError> {
        self.state = ControllerState::Enabling;
        let mut cc = ControllerConfig::from_raw(self.regs.read32(offsets::CC));
        cc.set_enable(true);
        self.regs.write32(offsets::CC, cc.raw());

        let deadline = Deadline::after_ms(&self.clock, self.ready_timeout_ms());
        loop {
            let status = self.status();
            if status.fatal_status() {
                self.state = ControllerState::Fatal;
                log::error!("NVMe controller reported fatal status during enable");
                return Err(NvmeError::FatalControllerStatus);
            }
            if status.ready() {
                break;
            }
            if deadline.expired(&self.clock) {
                self.state = ControllerState::Fatal;
                log::error!("NVMe controller did not become ready");
                return Err(NvmeError::EnableTimeout);
            }
            core::hint::spin_loop();
        }
        self.state = ControllerState::Ready;
        log::debug!("NVMe controller enabled");
        Ok(())
    }

    /// Ready状態であることを確認
    fn ensure_ready(&self) -> Result<(), NvmeError> {
        if self.state == ControllerState::Ready {
            Ok(())
        } else {
            Err(NvmeError::NotReady)
        }
    }

    // ========================================================================
    // Admin Orchestration
    // ========================================================================

    /// AdminコマンドをAdmin Queueで実行し、完了まで待つ
    fn admin_command(&mut self, cmd: Command) -> Result<Completion, NvmeError> {
        self.ensure_ready()?;
        let timeout = self.config.command_timeout_ms;
        let admin = self.admin.as_mut().ok_or(NvmeError::NotReady)?;
        let cid = admin.dispatch(&self.regs, cmd)?;
        self.stats.commands_submitted += 1;
        let result = admin.await_completion(&self.regs, cid, timeout, &self.clock);
        match &result {
            Ok(_) => self.stats.commands_completed += 1,
            Err(_) => self.stats.errors += 1,
        }
        result
    }

    /// Identify Controllerを実行し、コントローラ情報をデコードする
    fn identify_controller(&mut self) -> Result<(), NvmeError> {
        let buf = DmaBuffer::new_zeroed(PAGE_SIZE)?;
        self.admin_command(Command::identify_controller(buf.phys_addr()))?;

        // Safety: コマンド完了後、バッファにはコントローラが書いた
        // 4096バイトのIdentify構造体が入っている
        let data = unsafe { &*(buf.as_ptr() as *const IdentifyController) };

        let by_mdts = data.max_data_transfer_size(self.caps.min_page_size());
        self.max_transfer = if by_mdts == 0 {
            MAX_TRANSFER_SIZE
        } else {
            by_mdts.min(PRP_LIST_ENTRIES * PAGE_SIZE)
        };

        let identity = ControllerIdentity {
            vendor_id: data.vid,
            subsystem_vendor_id: data.ssvid,
            serial: String::from(data.serial_number()),
            model: String::from(data.model_number()),
            firmware: String::from(data.firmware_revision()),
            max_queue_entries: data.max_queue_entries(),
            namespace_count: data.namespace_count(),
            mdts: data.mdts,
        };
        log::info!(
            "NVMe identify: model \"{}\", serial \"{}\", firmware \"{}\", {} namespace(s)",
            identity.model,
            identity.serial,
            identity.firmware,
            identity.namespace_count
        );
        self.identity = Some(identity);
        Ok(())
    }

    /// アクティブなネームスペースを列挙し、テーブルに登録する
    fn discover_namespaces(&mut self) -> Result<(), NvmeError> {
        let mut buf = DmaBuffer::new_zeroed(PAGE_SIZE)?;
        self.admin_command(Command::identify_namespace_list(0, buf.phys_addr()))?;

        let mut ids = Vec::new();
        for chunk in buf.as_slice().chunks_exact(4) {
            let nsid = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if nsid == 0 {
                break;
            }
            ids.push(nsid);
        }

        for nsid in ids {
            buf.as_mut_slice().fill(0);
            self.admin_command(Command::identify_namespace(nsid, buf.phys_addr()))?;
            // Safety: コマンド完了後、バッファにはIdentify Namespace構造体が入っている
            let data = unsafe { &*(buf.as_ptr() as *const IdentifyNamespace) };
            let ns = Namespace::from_identify(nsid, data);
            log::info!(
                "NVMe namespace {}: {} blocks x {} bytes{}",
                ns.id,
                ns.blocks,
                ns.block_size,
                if ns.active { "" } else { " (inactive)" }
            );
            self.namespaces.insert(ns);
        }
        Ok(())
    }

    /// I/Oキューペアを作成する
    ///
    /// 各キューについて、Completion Queueを先に作成し、そのackの後で
    /// Completion Queue IDを参照するSubmission Queueを作成する。失敗時は
    /// 残りの作成を中止し、ackされなかったリングのみ解放する。
    fn create_io_queues(&mut self) -> Result<(), NvmeError> {
        let requested = self.config.io_queue_depth;
        let mut depth = requested
            .min(MAX_QUEUE_DEPTH)
            .min(self.caps.max_queue_entries().min(u16::MAX as u32) as u16);
        if let Some(identity) = &self.identity {
            if identity.max_queue_entries > 0 {
                depth = depth.min(identity.max_queue_entries);
            }
        }
        let depth = depth.max(2);
        if depth < requested {
            log::info!("NVMe I/O queue depth clamped {} -> {}", requested, depth);
        }

        for qid in 1..=self.config.io_queue_count {
            let cq_ring = DmaBuffer::new_zeroed(depth as usize * CQE_SIZE)?;
            if let Err(err) =
                self.admin_command(Command::create_io_cq(qid, depth, cq_ring.phys_addr()))
            {
                // CQは未ackなのでリングはこのまま解放できる
                log::error!("NVMe create I/O CQ {} failed: {}", qid, err);
                return Err(err);
            }

            let sq_ring = DmaBuffer::new_zeroed(depth as usize * SQE_SIZE)?;
            if let Err(err) = self.admin_command(Command::create_io_sq(
                qid,
                depth,
                sq_ring.phys_addr(),
                qid,
            )) {
                // SQは未ackなので解放してよいが、CQは作成済みで
                // コントローラのDMA対象のため保持し続ける
                self.retained.push(cq_ring);
                log::error!("NVMe create I/O SQ {} failed: {}", qid, err);
                return Err(err);
            }

            log::debug!("NVMe I/O queue {} created (depth {})", qid, depth);
            self.io_queues
                .push(QueuePair::new(qid, sq_ring, cq_ring, depth, self.stride));
        }
        Ok(())
    }

    // ========================================================================
    // Data Path
    // ========================================================================

    /// I/O転送の事前検証。転送バイト数を返す
    ///
    /// 範囲・パラメータ検証はハードウェアに触れる前に完結する。
    fn validate_io(&self, nsid: u32, lba: u64, count: u32, buf_len: usize) -> Result<usize, NvmeError> {
        self.ensure_ready()?;
        if self.io_queues.is_empty() {
            return Err(NvmeError::NotReady);
        }
        let ns = self
            .namespaces
            .get_active(nsid)
            .ok_or(NvmeError::InvalidNamespace)?;
        if count == 0 {
            return Err(NvmeError::InvalidParameter("block count must be > 0"));
        }
        if !ns.contains_range(lba, count) {
            return Err(NvmeError::OutOfRangeAccess);
        }
        let bytes = count as usize * ns.block_size as usize;
        if buf_len != bytes {
            return Err(NvmeError::InvalidParameter("buffer length != count * block size"));
        }
        if bytes > self.max_transfer {
            return Err(NvmeError::TransferTooLarge);
        }
        Ok(bytes)
    }

    /// 転送範囲からPRP1/PRP2を組み立てる
    ///
    /// 2ページを超える転送はPRPリストを使う。リストは完了まで生存させる
    /// 必要があるため、呼び出し側に所有権を返す。
    fn build_prps(
        &self,
        addr: u64,
        bytes: usize,
    ) -> Result<(u64, u64, Option<Box<PrpList>>), NvmeError> {
        debug_assert_eq!(addr as usize % PAGE_SIZE, 0);
        let pages = bytes.div_ceil(PAGE_SIZE);
        match pages {
            0 | 1 => Ok((addr, 0, None)),
            2 => Ok((addr, addr + PAGE_SIZE as u64, None)),
            n => {
                let mut list = Box::new(PrpList::new());
                for i in 1..n {
                    list.add_entry(addr + (i * PAGE_SIZE) as u64)?;
                }
                let list_addr = list.phys_addr();
                Ok((addr, list_addr, Some(list)))
            }
        }
    }

    /// I/OコマンドをI/Oキュー0で実行し、完了まで待つ
    fn io_command(&mut self, cmd: Command) -> Result<Completion, NvmeError> {
        let timeout = self.config.command_timeout_ms;
        let queue = self.io_queues.first_mut().ok_or(NvmeError::NotReady)?;
        let cid = queue.dispatch(&self.regs, cmd)?;
        self.stats.commands_submitted += 1;
        let result = queue.await_completion(&self.regs, cid, timeout, &self.clock);
        match &result {
            Ok(_) => self.stats.commands_completed += 1,
            Err(_) => self.stats.errors += 1,
        }
        result
    }

    /// 論理ブロック範囲を読み取る
    ///
    /// `buf`がページアラインされていない場合は一時的なアライン済み
    /// バッファ経由でコピーする（エラーではない）。失敗ステータスは
    /// リトライせず呼び出し側へ返す。
    pub fn read(&mut self, nsid: u32, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), NvmeError> {
        let bytes = self.validate_io(nsid, lba, count, buf.len())?;

        let bounce = if buf.as_ptr() as usize % PAGE_SIZE != 0 {
            Some(DmaBuffer::new_zeroed(bytes)?)
        } else {
            None
        };
        let target = bounce
            .as_ref()
            .map(|b| b.phys_addr())
            .unwrap_or(buf.as_ptr() as u64);

        let (prp1, prp2, _prp_list) = self.build_prps(target, bytes)?;
        self.io_command(Command::read(nsid, lba, count, prp1, prp2))?;

        if let Some(bounce) = &bounce {
            buf.copy_from_slice(&bounce.as_slice()[..bytes]);
        }
        self.stats.read_bytes += bytes as u64;
        Ok(())
    }

    /// 論理ブロック範囲へ書き込む
    pub fn write(&mut self, nsid: u32, lba: u64, count: u32, buf: &[u8]) -> Result<(), NvmeError> {
        let bytes = self.validate_io(nsid, lba, count, buf.len())?;

        let bounce = if buf.as_ptr() as usize % PAGE_SIZE != 0 {
            let mut staged = DmaBuffer::new_zeroed(bytes)?;
            staged.as_mut_slice()[..bytes].copy_from_slice(buf);
            Some(staged)
        } else {
            None
        };
        let target = bounce
            .as_ref()
            .map(|b| b.phys_addr())
            .unwrap_or(buf.as_ptr() as u64);

        let (prp1, prp2, _prp_list) = self.build_prps(target, bytes)?;
        self.io_command(Command::write(nsid, lba, count, prp1, prp2))?;

        self.stats.write_bytes += bytes as u64;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
