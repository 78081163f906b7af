// ============================================================================
// src/mock.rs - In-Memory Mock Controller (test only)
// ============================================================================
//!
//! Deterministic in-memory stand-in for an NVMe controller.
//!
//! Implements [`RegisterSpace`] and emulates the wire contract the driver
//! relies on: the CC.EN/CSTS.RDY handshake, submission-doorbell-triggered
//! command execution against ring memory (through the flat mapping), phase
//! tagged completion posting, PRP data transfer against an in-memory disk
//! image and identify data synthesis. Behavior knobs simulate the failure
//! modes the state machine has to survive.

extern crate alloc;

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Ref, RefCell, RefMut};
use core::ptr;

use hashbrown::HashMap;

use crate::commands::{Command, Completion};
use crate::defs::{AdminOpcode, IdentifyCns, IoOpcode, PAGE_SIZE, SQE_SIZE};
use crate::identify::{IdentifyController, IdentifyNamespace, LbaFormat};
use crate::mmio::RegisterSpace;
use crate::regs::{cc_bits, csts_bits, offsets};

/// 登録済みSubmission Queue
#[derive(Clone, Copy)]
struct MockSq {
    base: u64,
    depth: u16,
    head: u16,
    cqid: u16,
}

/// 登録済みCompletion Queue
#[derive(Clone, Copy)]
struct MockCq {
    base: u64,
    depth: u16,
    tail: u16,
    phase: bool,
}

/// モックコントローラの内部状態
pub struct MockState {
    // レジスタ
    pub cc: u32,
    pub csts: u32,
    pub aqa: u32,
    pub asq: u64,
    pub acq: u64,
    // CAP構成要素
    mqes: u16,
    dstrd: u8,
    // キュー
    admin_sq: Option<MockSq>,
    admin_cq: Option<MockCq>,
    io_sqs: HashMap<u16, MockSq>,
    io_cqs: HashMap<u16, MockCq>,
    // メディア
    disk: Vec<u8>,
    blocks: u64,
    block_size: u32,
    // Identify内容
    maxcmd: u16,
    nn: u32,
    // 観測用カウンタ
    pub doorbell_writes: usize,
    pub admin_opcode_log: Vec<u8>,
    // 故障注入
    pub ignore_doorbells: bool,
    pub never_ready: bool,
    pub stuck_ready: bool,
    pub fatal_on_enable: bool,
    pub fail_create_sq: Option<u16>,
    pub fail_create_cq: Option<u16>,
    /// 非ゼロならI/Oコマンドをこのステータス（フェーズ抜き）で失敗させる
    pub io_status: u16,
}

impl MockState {
    fn cap(&self) -> u64 {
        // MQES | TO=1 (500ms) | DSTRD | CSS=NVM
        self.mqes as u64 | (1u64 << 24) | ((self.dstrd as u64) << 32) | (1u64 << 37)
    }

    fn stride_bytes(&self) -> u64 {
        4 << self.dstrd
    }
}

/// テスト用モックNVMeコントローラ
///
/// `handle()`で同じ状態を共有する複製を作れるため、コントローラに
/// ムーブした後も観測・故障注入ができる。
pub struct MockNvme {
    state: Rc<RefCell<MockState>>,
}

impl MockNvme {
    /// `blocks` x `block_size`のディスクを持つモックを作成
    pub fn new(blocks: u64, block_size: u32) -> Self {
        assert!(block_size.is_power_of_two());
        Self {
            state: Rc::new(RefCell::new(MockState {
                cc: 0,
                csts: 0,
                aqa: 0,
                asq: 0,
                acq: 0,
                mqes: 255,
                dstrd: 0,
                admin_sq: None,
                admin_cq: None,
                io_sqs: HashMap::new(),
                io_cqs: HashMap::new(),
                disk: vec![0u8; (blocks * block_size as u64) as usize],
                blocks,
                block_size,
                maxcmd: 0,
                nn: 1,
                doorbell_writes: 0,
                admin_opcode_log: Vec::new(),
                ignore_doorbells: false,
                never_ready: false,
                stuck_ready: false,
                fatal_on_enable: false,
                fail_create_sq: None,
                fail_create_cq: None,
                io_status: 0,
            })),
        }
    }

    /// 状態を共有する複製を作成
    pub fn handle(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }

    /// 内部状態を参照
    pub fn state(&self) -> Ref<'_, MockState> {
        self.state.borrow()
    }

    /// 内部状態を可変参照
    pub fn state_mut(&self) -> RefMut<'_, MockState> {
        self.state.borrow_mut()
    }

    /// ドアベルストライドフィールドを設定
    pub fn with_dstrd(self, dstrd: u8) -> Self {
        self.state.borrow_mut().dstrd = dstrd;
        self
    }

    /// CAP.MQESを設定（0ベース）
    pub fn with_mqes(self, mqes: u16) -> Self {
        self.state.borrow_mut().mqes = mqes;
        self
    }

    /// Identifyが報告する最大キューエントリ数を設定
    pub fn with_maxcmd(self, maxcmd: u16) -> Self {
        self.state.borrow_mut().maxcmd = maxcmd;
        self
    }

    /// 有効化してもRDYにならない故障を注入
    pub fn with_never_ready(self) -> Self {
        self.state.borrow_mut().never_ready = true;
        self
    }

    /// 無効化してもRDYが落ちない故障を注入（初期状態は有効）
    pub fn with_stuck_ready(self) -> Self {
        {
            let mut state = self.state.borrow_mut();
            state.stuck_ready = true;
            state.cc = cc_bits::EN;
            state.csts = csts_bits::RDY;
        }
        self
    }

    /// 有効化時にCFSを立てる故障を注入
    pub fn with_fatal_on_enable(self) -> Self {
        self.state.borrow_mut().fatal_on_enable = true;
        self
    }

    /// 指定QIDのSubmission Queue作成を失敗させる
    pub fn with_failing_create_sq(self, qid: u16) -> Self {
        self.state.borrow_mut().fail_create_sq = Some(qid);
        self
    }

    /// ディスク内容を直接参照（検証用）
    pub fn disk_snapshot(&self) -> Vec<u8> {
        self.state.borrow().disk.clone()
    }
}

impl RegisterSpace for MockNvme {
    fn read32(&self, offset: u64) -> u32 {
        let state = self.state.borrow();
        match offset {
            offsets::VS => 0x0002_0000,
            offsets::CC => state.cc,
            offsets::CSTS => state.csts,
            offsets::AQA => state.aqa,
            _ => 0,
        }
    }

    fn write32(&self, offset: u64, value: u32) {
        let mut state = self.state.borrow_mut();
        if offset >= offsets::SQ0TDBL {
            handle_doorbell(&mut state, offset - offsets::SQ0TDBL, value);
            return;
        }
        match offset {
            offsets::CC => handle_cc_write(&mut state, value),
            offsets::AQA => state.aqa = value,
            _ => {}
        }
    }

    fn read64(&self, offset: u64) -> u64 {
        let state = self.state.borrow();
        match offset {
            offsets::CAP => state.cap(),
            offsets::ASQ => state.asq,
            offsets::ACQ => state.acq,
            _ => 0,
        }
    }

    fn write64(&self, offset: u64, value: u64) {
        let mut state = self.state.borrow_mut();
        match offset {
            offsets::ASQ => state.asq = value,
            offsets::ACQ => state.acq = value,
            _ => {}
        }
    }
}

// ============================================================================
// Register semantics
// ============================================================================

fn handle_cc_write(state: &mut MockState, value: u32) {
    state.cc = value;
    if value & cc_bits::EN != 0 {
        if state.fatal_on_enable {
            state.csts |= csts_bits::CFS;
            return;
        }
        if state.never_ready {
            return;
        }
        // Admin Queueを登録して運用開始
        let sq_depth = (state.aqa & 0xFFF) as u16 + 1;
        let cq_depth = ((state.aqa >> 16) & 0xFFF) as u16 + 1;
        state.admin_sq = Some(MockSq {
            base: state.asq,
            depth: sq_depth,
            head: 0,
            cqid: 0,
        });
        state.admin_cq = Some(MockCq {
            base: state.acq,
            depth: cq_depth,
            tail: 0,
            phase: true,
        });
        state.csts |= csts_bits::RDY;
    } else if !state.stuck_ready {
        state.csts &= !csts_bits::RDY;
    }
}

fn handle_doorbell(state: &mut MockState, rel: u64, value: u32) {
    state.doorbell_writes += 1;
    if state.ignore_doorbells {
        return;
    }
    let pair = 2 * state.stride_bytes();
    if rel % pair == 0 {
        let qid = (rel / pair) as u16;
        process_sq(state, qid, value as u16);
    }
    // CQヘッドドアベル（rel % pair == 4）はスロット解放の通知のみで、
    // このモックでは追加の動作を持たない
}

// ============================================================================
// Command execution
// ============================================================================

fn get_sq(state: &MockState, qid: u16) -> Option<MockSq> {
    if qid == 0 {
        state.admin_sq
    } else {
        state.io_sqs.get(&qid).copied()
    }
}

fn put_sq(state: &mut MockState, qid: u16, sq: MockSq) {
    if qid == 0 {
        state.admin_sq = Some(sq);
    } else {
        state.io_sqs.insert(qid, sq);
    }
}

fn process_sq(state: &mut MockState, qid: u16, new_tail: u16) {
    loop {
        let mut sq = match get_sq(state, qid) {
            Some(sq) => sq,
            None => return,
        };
        if sq.head == new_tail {
            return;
        }
        let cmd = unsafe {
            ptr::read_volatile((sq.base + sq.head as u64 * SQE_SIZE as u64) as *const Command)
        };
        sq.head = (sq.head + 1) % sq.depth;
        put_sq(state, qid, sq);

        let (status, result) = if qid == 0 {
            execute_admin(state, &cmd)
        } else {
            execute_io(state, &cmd)
        };
        post_completion(state, qid, sq.head, cmd.cid(), status, result);
    }
}

fn post_completion(state: &mut MockState, sq_id: u16, sq_head: u16, cid: u16, status: u16, result: u32) {
    let cqid = if sq_id == 0 {
        0
    } else {
        match state.io_sqs.get(&sq_id) {
            Some(sq) => sq.cqid,
            None => return,
        }
    };
    let mut cq = if cqid == 0 {
        match state.admin_cq {
            Some(cq) => cq,
            None => return,
        }
    } else {
        match state.io_cqs.get(&cqid) {
            Some(cq) => *cq,
            None => return,
        }
    };

    let cqe = Completion {
        result,
        rsvd: 0,
        sq_head,
        sq_id,
        cid,
        status: status | cq.phase as u16,
    };
    unsafe {
        let slot = (cq.base + cq.tail as u64 * 16) as *mut Completion;
        ptr::write_volatile(slot, cqe);
    }
    cq.tail = (cq.tail + 1) % cq.depth;
    if cq.tail == 0 {
        cq.phase = !cq.phase;
    }

    if cqid == 0 {
        state.admin_cq = Some(cq);
    } else {
        state.io_cqs.insert(cqid, cq);
    }
}

/// ステータスフィールド（フェーズ抜き）を作る
fn status_field(sct: u8, sc: u8) -> u16 {
    ((sct as u16) << 9) | ((sc as u16) << 1)
}

fn execute_admin(state: &mut MockState, cmd: &Command) -> (u16, u32) {
    state.admin_opcode_log.push(cmd.opcode());
    match cmd.opcode() {
        op if op == AdminOpcode::Identify as u8 => execute_identify(state, cmd),
        op if op == AdminOpcode::CreateIOCQ as u8 => {
            let qid = (cmd.cdw10 & 0xFFFF) as u16;
            let depth = ((cmd.cdw10 >> 16) & 0xFFFF) as u16 + 1;
            if state.fail_create_cq == Some(qid) {
                return (status_field(1, 0x01), 0);
            }
            state.io_cqs.insert(
                qid,
                MockCq {
                    base: cmd.prp1,
                    depth,
                    tail: 0,
                    phase: true,
                },
            );
            (0, 0)
        }
        op if op == AdminOpcode::CreateIOSQ as u8 => {
            let qid = (cmd.cdw10 & 0xFFFF) as u16;
            let depth = ((cmd.cdw10 >> 16) & 0xFFFF) as u16 + 1;
            let cqid = (cmd.cdw11 >> 16) as u16;
            if state.fail_create_sq == Some(qid) {
                return (status_field(1, 0x01), 0);
            }
            // 作成済みCQへの参照でなければNVMe的にはCompletion Queue Invalid
            if !state.io_cqs.contains_key(&cqid) {
                return (status_field(1, 0x00), 0);
            }
            state.io_sqs.insert(
                qid,
                MockSq {
                    base: cmd.prp1,
                    depth,
                    head: 0,
                    cqid,
                },
            );
            (0, 0)
        }
        _ => (status_field(0, 0x01), 0),
    }
}

fn execute_identify(state: &mut MockState, cmd: &Command) -> (u16, u32) {
    let cns = (cmd.cdw10 & 0xFF) as u8;
    if cns == IdentifyCns::Controller as u8 {
        let mut ident = IdentifyController::default();
        ident.vid = 0x1B36;
        ident.ssvid = 0x1AF4;
        write_padded(&mut ident.sn, b"EXO0001");
        write_padded(&mut ident.mn, b"EXOSTOR MOCK CTRL");
        write_padded(&mut ident.fr, b"1.0");
        ident.mdts = 0;
        ident.maxcmd = state.maxcmd;
        ident.nn = state.nn;
        unsafe {
            ptr::copy_nonoverlapping(
                &ident as *const IdentifyController as *const u8,
                cmd.prp1 as *mut u8,
                PAGE_SIZE,
            );
        }
        (0, 0)
    } else if cns == IdentifyCns::Namespace as u8 {
        if cmd.nsid != 1 {
            return (status_field(0, 0x0B), 0);
        }
        let mut ns = IdentifyNamespace::default();
        ns.nsze = state.blocks;
        ns.ncap = state.blocks;
        ns.nuse = state.blocks;
        ns.nlbaf = 0;
        ns.flbas = 0;
        ns.lbaf[0] = LbaFormat {
            ms: 0,
            lbads: state.block_size.trailing_zeros() as u8,
            rp: 0,
        };
        unsafe {
            ptr::copy_nonoverlapping(
                &ns as *const IdentifyNamespace as *const u8,
                cmd.prp1 as *mut u8,
                PAGE_SIZE,
            );
        }
        (0, 0)
    } else if cns == IdentifyCns::ActiveNamespaceList as u8 {
        unsafe {
            ptr::write_bytes(cmd.prp1 as *mut u8, 0, PAGE_SIZE);
            if cmd.nsid < 1 {
                ptr::write_volatile(cmd.prp1 as *mut u32, 1u32.to_le());
            }
        }
        (0, 0)
    } else {
        (status_field(0, 0x02), 0)
    }
}

fn execute_io(state: &mut MockState, cmd: &Command) -> (u16, u32) {
    if state.io_status != 0 {
        return (state.io_status, 0);
    }
    if cmd.nsid != 1 {
        return (status_field(0, 0x0B), 0);
    }

    let count = cmd.cdw10 as u64 + 1;
    let slba = cmd.cdw11 as u64 | ((cmd.cdw12 as u64) << 32);
    if slba + count > state.blocks {
        return (status_field(0, 0x02), 0);
    }
    let bytes = (count * state.block_size as u64) as usize;
    let disk_offset = (slba * state.block_size as u64) as usize;
    let pages = gather_prps(cmd.prp1, cmd.prp2, bytes);

    let mut copied = 0usize;
    for page in pages {
        let chunk = (bytes - copied).min(PAGE_SIZE);
        unsafe {
            match cmd.opcode() {
                op if op == IoOpcode::Read as u8 => ptr::copy_nonoverlapping(
                    state.disk.as_ptr().add(disk_offset + copied),
                    page as *mut u8,
                    chunk,
                ),
                op if op == IoOpcode::Write as u8 => ptr::copy_nonoverlapping(
                    page as *const u8,
                    state.disk.as_mut_ptr().add(disk_offset + copied),
                    chunk,
                ),
                _ => return (status_field(0, 0x01), 0),
            }
        }
        copied += chunk;
        if copied >= bytes {
            break;
        }
    }
    (0, 0)
}

/// PRP1/PRP2/PRPリストから転送先ページアドレス列を得る
fn gather_prps(prp1: u64, prp2: u64, bytes: usize) -> Vec<u64> {
    let n = bytes.div_ceil(PAGE_SIZE);
    let mut pages = vec![prp1];
    if n == 2 {
        pages.push(prp2);
    } else if n > 2 {
        for i in 0..(n - 1) {
            let entry = unsafe { ptr::read_volatile((prp2 + i as u64 * 8) as *const u64) };
            pages.push(entry);
        }
    }
    pages
}

/// スペースパディング付きでASCIIフィールドへ書き込む
fn write_padded(field: &mut [u8], value: &[u8]) {
    field.fill(b' ');
    let n = value.len().min(field.len());
    field[..n].copy_from_slice(&value[..n]);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_handshake() {
        let mock = MockNvme::new(64, 512);
        assert_eq!(mock.read32(offsets::CSTS) & csts_bits::RDY, 0);
        mock.write32(offsets::CC, cc_bits::EN);
        assert_ne!(mock.read32(offsets::CSTS) & csts_bits::RDY, 0);
        mock.write32(offsets::CC, 0);
        assert_eq!(mock.read32(offsets::CSTS) & csts_bits::RDY, 0);
    }

    #[test]
    fn test_cap_encoding() {
        let mock = MockNvme::new(64, 512).with_mqes(15).with_dstrd(2);
        let cap = crate::regs::Capabilities::new(mock.read64(offsets::CAP));
        assert_eq!(cap.max_queue_entries(), 16);
        assert_eq!(cap.doorbell_stride_bytes(), 16);
        assert_eq!(cap.timeout_ms(), 500);
        assert!(cap.css_nvm());
    }

    #[test]
    fn test_doorbell_writes_counted_when_ignored() {
        let mock = MockNvme::new(64, 512);
        mock.state_mut().ignore_doorbells = true;
        mock.write32(offsets::SQ0TDBL, 1);
        mock.write32(offsets::SQ0TDBL + 4, 1);
        assert_eq!(mock.state().doorbell_writes, 2);
    }
}
