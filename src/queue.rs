// ============================================================================
// src/queue.rs - NVMe Queue Pairs and Completion Polling
// ============================================================================
//!
//! NVMeサブミッションキュー・コンプリーションキュー実装
//!
//! NVMe Base Specification 2.0 Section 4に基づくリングプロトコル実装。
//!
//! ## 順序保証
//! - SQエントリのリングメモリへの書き込みは、ドアベル書き込みより先に
//!   完了していなければならない（`submit`内のReleaseフェンス）。
//! - CQエントリはフェーズビットの一致を確認してから残りのフィールドを
//!   読む（`peek`内のAcquireフェンス）。
//!
//! ## コマンドID
//! コマンドIDはキュー毎に単調増加するu16で、投入時に割り当てられる。
//! 同時実行中のコマンド数はリングフル判定により常に`depth - 1`以下に
//! 抑えられるため、u16への切り詰めで衝突は起こらない（`submit`内で
//! 明示的にアサートしている）。

extern crate alloc;

use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use crate::commands::{Command, Completion};
use crate::defs::{CQE_SIZE, MAX_QUEUE_DEPTH, SQE_SIZE};
use crate::dma::DmaBuffer;
use crate::error::NvmeError;
use crate::mmio::RegisterSpace;
use crate::time::{Clock, Deadline};

// ============================================================================
// Doorbell Address Computation
// ============================================================================

/// ドアベルレジスタアドレス計算
///
/// レジスタレイアウトはSQ/CQドアベルをキューID毎にインターリーブする。
/// Admin Queueはキュー0として同じ式に畳み込まれる:
/// SQテールドアベルは`0x1000 + 2*qid*stride`、CQヘッドドアベルはその
/// 4バイト先。
pub mod doorbell {
    /// ドアベル領域の先頭オフセット（SQ0TDBL）
    pub const DOORBELL_BASE: u64 = 0x1000;

    /// Submission Queueテールドアベルのレジスタオフセット
    pub fn sq_doorbell(qid: u16, stride_bytes: usize) -> u64 {
        DOORBELL_BASE + (2 * qid as u64) * stride_bytes as u64
    }

    /// Completion Queueヘッドドアベルのレジスタオフセット
    pub fn cq_doorbell(qid: u16, stride_bytes: usize) -> u64 {
        DOORBELL_BASE + 4 + (2 * qid as u64) * stride_bytes as u64
    }
}

// ============================================================================
// Submission Queue
// ============================================================================

/// NVMe Submission Queue
pub struct SubmissionQueue {
    /// リングバッファ（ページアライン、ゼロ初期化済み）
    ring: DmaBuffer,
    /// キュー深度
    depth: u16,
    /// Tailポインタ（プロデューサ）
    tail: u16,
    /// Headポインタ（ソフトウェア追跡、CQEのsq_headスナップショットで更新）
    head: u16,
    /// 次に割り当てるコマンドID（単調増加）
    next_cid: u16,
    /// ドアベルレジスタオフセット
    doorbell: u64,
}

impl SubmissionQueue {
    /// 新しいSubmission Queueを作成
    fn new(ring: DmaBuffer, depth: u16, doorbell: u64) -> Self {
        debug_assert!(depth >= 2 && depth <= MAX_QUEUE_DEPTH);
        debug_assert!(ring.len() >= depth as usize * SQE_SIZE);
        Self {
            ring,
            depth,
            tail: 0,
            head: 0,
            next_cid: 0,
            doorbell,
        }
    }

    /// キュー深度を取得
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// リングの物理ベースアドレスを取得
    pub fn base_phys(&self) -> u64 {
        self.ring.phys_addr()
    }

    /// 現在のtailポインタを取得
    pub fn tail(&self) -> u16 {
        self.tail
    }

    /// 実行中コマンド数
    pub fn in_flight(&self) -> u16 {
        ((self.tail as u32 + self.depth as u32 - self.head as u32) % self.depth as u32) as u16
    }

    /// キューがフルかどうか
    pub fn is_full(&self) -> bool {
        (self.tail + 1) % self.depth == self.head
    }

    /// コマンドを次の空きスロットに書き込み、tailを進める
    ///
    /// 割り当てたコマンドIDを返す。フルの場合はリングにもドアベルにも
    /// 一切触れずに`QueueFull`で失敗する。ドアベルはまだ鳴らさない。
    fn submit(&mut self, mut cmd: Command) -> Result<u16, NvmeError> {
        if self.is_full() {
            return Err(NvmeError::QueueFull);
        }
        // コマンドID切り詰めの安全条件: 同時実行数 < 深度 <= 4096
        debug_assert!(self.in_flight() < self.depth);

        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);
        cmd.set_cid(cid);

        unsafe {
            let slot = (self.ring.as_mut_ptr() as *mut Command).add(self.tail as usize);
            ptr::write_volatile(slot, cmd);
        }
        // エントリ書き込みはドアベル書き込みより先に可視化されること
        fence(Ordering::Release);

        self.tail = (self.tail + 1) % self.depth;
        Ok(cid)
    }

    /// Headポインタを更新（CQEのsq_headスナップショットから）
    fn update_head(&mut self, new_head: u16) {
        if new_head < self.depth {
            self.head = new_head;
        }
    }

    /// 現在のtailをドアベルに書いてコントローラに通知
    fn ring_doorbell(&self, regs: &dyn RegisterSpace) {
        regs.write32(self.doorbell, self.tail as u32);
    }
}

// ============================================================================
// Completion Queue
// ============================================================================

/// NVMe Completion Queue
pub struct CompletionQueue {
    /// リングバッファ（ページアライン、ゼロ初期化済み）
    ring: DmaBuffer,
    /// キュー深度
    depth: u16,
    /// Headポインタ（コンシューマ）
    head: u16,
    /// 期待するフェーズビット（リングが一周する毎に反転）
    phase: bool,
    /// ドアベルレジスタオフセット
    doorbell: u64,
}

impl CompletionQueue {
    /// 新しいCompletion Queueを作成
    fn new(ring: DmaBuffer, depth: u16, doorbell: u64) -> Self {
        debug_assert!(depth >= 2 && depth <= MAX_QUEUE_DEPTH);
        debug_assert!(ring.len() >= depth as usize * CQE_SIZE);
        Self {
            ring,
            depth,
            head: 0,
            phase: true,
            doorbell,
        }
    }

    /// キュー深度を取得
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// リングの物理ベースアドレスを取得
    pub fn base_phys(&self) -> u64 {
        self.ring.phys_addr()
    }

    /// 現在のheadポインタを取得
    pub fn head(&self) -> u16 {
        self.head
    }

    /// head位置のエントリが有効なら読み取る（headは進めない）
    ///
    /// フェーズビットが期待値と一致して初めてエントリは有効。フェーズの
    /// 確認が他フィールドの読み取りより先に行われるよう、間にAcquire
    /// フェンスを置く。
    fn peek(&self) -> Option<Completion> {
        let slot = unsafe { (self.ring.as_ptr() as *const Completion).add(self.head as usize) };
        let status = unsafe { ptr::read_volatile(ptr::addr_of!((*slot).status)) };
        if (status & 1 != 0) != self.phase {
            return None;
        }
        fence(Ordering::Acquire);
        Some(unsafe { ptr::read_volatile(slot) })
    }

    /// 有効なエントリを1つ消費してheadを進める
    ///
    /// headが0に戻る瞬間にのみフェーズを反転する。
    fn pop(&mut self) -> Option<Completion> {
        let cqe = self.peek()?;
        self.head = (self.head + 1) % self.depth;
        if self.head == 0 {
            self.phase = !self.phase;
        }
        Some(cqe)
    }

    /// 現在のheadをドアベルに書いてコントローラに通知（スロット解放の合図）
    fn ring_doorbell(&self, regs: &dyn RegisterSpace) {
        regs.write32(self.doorbell, self.head as u32);
    }
}

// ============================================================================
// Queue Pair
// ============================================================================

/// NVMe Queue Pair (SQ + CQ、共通のキューID)
pub struct QueuePair {
    /// キューID（Admin Queueは0）
    id: u16,
    /// Submission Queue
    sq: SubmissionQueue,
    /// Completion Queue
    cq: CompletionQueue,
    /// 待ち合わせ中ではないコマンドの完了の一時置き場
    ///
    /// 複数コマンドが投入順と異なる順序で完了しうるため、`poll_for`が
    /// 対象外の有効エントリを消費した場合はここに退避し、後続の
    /// 待ち合わせで返す。
    pending: Vec<Completion>,
}

impl QueuePair {
    /// 新しいQueue Pairを作成
    ///
    /// `sq_ring`/`cq_ring`は深度分のエントリを収められるページアライン
    /// 済みバッファであること。ドアベルオフセットはキューIDとストライド
    /// から計算される。
    pub fn new(id: u16, sq_ring: DmaBuffer, cq_ring: DmaBuffer, depth: u16, stride_bytes: usize) -> Self {
        Self {
            id,
            sq: SubmissionQueue::new(sq_ring, depth, doorbell::sq_doorbell(id, stride_bytes)),
            cq: CompletionQueue::new(cq_ring, depth, doorbell::cq_doorbell(id, stride_bytes)),
            pending: Vec::new(),
        }
    }

    /// キューIDを取得
    pub fn id(&self) -> u16 {
        self.id
    }

    /// キュー深度を取得
    pub fn depth(&self) -> u16 {
        self.sq.depth()
    }

    /// SQリングの物理ベースアドレス
    pub fn sq_base_phys(&self) -> u64 {
        self.sq.base_phys()
    }

    /// CQリングの物理ベースアドレス
    pub fn cq_base_phys(&self) -> u64 {
        self.cq.base_phys()
    }

    /// 実行中コマンド数
    pub fn in_flight(&self) -> u16 {
        self.sq.in_flight()
    }

    /// コマンドを投入してSubmissionドアベルを鳴らす
    ///
    /// 割り当てたコマンドIDを返す。`QueueFull`の場合リングもドアベルも
    /// 変化しない。リトライはしない。
    pub fn dispatch(&mut self, regs: &dyn RegisterSpace, cmd: Command) -> Result<u16, NvmeError> {
        let cid = self.sq.submit(cmd)?;
        self.sq.ring_doorbell(regs);
        Ok(cid)
    }

    /// 退避済み完了から`cid`を探す
    fn take_pending(&mut self, cid: u16) -> Option<Completion> {
        let idx = self.pending.iter().position(|c| c.cid == cid)?;
        Some(self.pending.swap_remove(idx))
    }

    /// `cid`の完了を1回だけ探す（ブロックしない）
    ///
    /// リング上の有効エントリを走査し、対象以外の完了は退避する。
    /// 消費したエントリのsq_headスナップショットでSQの空き状況を更新する。
    pub fn poll_for(&mut self, cid: u16) -> Option<Completion> {
        if let Some(cqe) = self.take_pending(cid) {
            return Some(cqe);
        }
        while let Some(cqe) = self.cq.pop() {
            self.sq.update_head(cqe.sq_head);
            if cqe.cid == cid {
                return Some(cqe);
            }
            debug_assert!(self.pending.len() < self.sq.depth() as usize);
            self.pending.push(cqe);
        }
        None
    }

    /// `cid`の完了をタイムアウト付きでビジーウェイトする
    ///
    /// 一致エントリを消費した後にCompletionドアベルを1回鳴らす（これが
    /// コントローラ側スロット解放の通知）。タイムアウトは`CommandTimeout`、
    /// コントローラのエラーステータスは`CommandStatusError`として区別して
    /// 返す。どちらもリトライしない。
    pub fn await_completion<C: Clock + ?Sized>(
        &mut self,
        regs: &dyn RegisterSpace,
        cid: u16,
        timeout_ms: u64,
        clock: &C,
    ) -> Result<Completion, NvmeError> {
        let deadline = Deadline::after_ms(clock, timeout_ms);
        loop {
            if let Some(cqe) = self.poll_for(cid) {
                self.cq.ring_doorbell(regs);
                if cqe.is_success() {
                    return Ok(cqe);
                }
                return Err(NvmeError::from_completion_status(cqe.status));
            }
            if deadline.expired(clock) {
                return Err(NvmeError::CommandTimeout);
            }
            core::hint::spin_loop();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
