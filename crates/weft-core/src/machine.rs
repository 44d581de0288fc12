use std::collections::VecDeque;
use std::fmt;

/// 状态机引擎对单个操作记录的最小要求。
///
/// # 设计背景（Why）
/// - 发送与接收、不同后端之间共享同一套"队列 + 条件转移"引擎，差异只在
///   状态枚举与动作函数。把二者通过该 trait 注入，引擎即可对所有方向复用。
///
/// # 契约说明（What）
/// - `State` 必须全序（`Ord`），状态值沿生命周期单调不减；
/// - `TERMINAL` 是唯一终态：一旦到达，记录等待从队头退场，不再参与转移；
/// - `sequence` 返回构造时由队列签发的序号，严格单调递增。
pub trait Operation {
    type State: Copy + Eq + Ord + fmt::Debug;

    /// 唯一终态。
    const TERMINAL: Self::State;

    fn sequence(&self) -> u64;
    fn state(&self) -> Self::State;
    fn set_state(&mut self, next: Self::State);
}

/// 判定"前驱状态至少到达 `at`"。
///
/// 队头操作没有前驱，以 `None` 表示；任何阈值条件对它都成立——这是对
/// 数值哨兵（取一个大于终态的值）的显式化替代。
pub fn prev_at_least<S: Ord>(prev: Option<S>, at: S) -> bool {
    match prev {
        None => true,
        Some(state) => state >= at,
    }
}

/// 尝试一次条件转移：`op` 处于 `from` 且 `cond` 成立时依序执行动作并置为 `to`。
///
/// 动作闭包在状态改写**之前**执行，与转移表"actions 后 set state"的语义一致；
/// 动作内只允许发起异步 I/O 或设备入队，不允许回写错误槽（见通道侧的延迟错误约定）。
pub fn attempt<O, F>(op: &mut O, from: O::State, to: O::State, cond: bool, actions: F) -> bool
where
    O: Operation,
    F: FnOnce(&mut O),
{
    if op.state() != from || !cond {
        return false;
    }
    actions(op);
    op.set_state(to);
    true
}

/// 方向内的操作队列：序号签发、FIFO 保序推进、队头退场。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 同方向相邻操作之间存在严格的发起顺序约束（控制流读写按序号发起、回调按序号触发），
///   用一条 FIFO 队列加"前驱状态"条件表达，比为每个操作单独建依赖图简单得多。
///
/// ## 逻辑解析（How）
/// - `emplace_back` 签发严格单调的序号并尾插记录；
/// - `advance` 从指定操作开始向后级联：对每个操作运行一遍转移表
///   （以前驱状态为输入），只要发生了转移就继续检查下一个操作——
///   前驱的前进可能正好解除后继的阻塞；一旦某个操作纹丝不动，级联停止；
/// - `advance_all` 不做提前停止，错误排空路径用它保证每个操作都被访问；
/// - 两者收尾时都会把已处于终态的队头逐个退场，腾出记录并保持索引代数简单。
///
/// ## 契约说明（What）
/// - 传入的 `advance_one` 返回该操作本轮是否发生过转移；
/// - 针对已退场序号的 `advance` 是无害的空操作（迟到的完成回调会撞上它）；
/// - **不变量**：回调在动作中按序号顺序被安排；队列中的状态序列单调不增
///   （队头最接近终态）。
pub struct OpQueue<O: Operation> {
    ops: VecDeque<O>,
    next_sequence: u64,
    head_sequence: u64,
}

impl<O: Operation> OpQueue<O> {
    pub fn new() -> Self {
        Self {
            ops: VecDeque::new(),
            next_sequence: 0,
            head_sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// 构造一个新记录并尾插；`build` 收到签发的序号。
    pub fn emplace_back(&mut self, build: impl FnOnce(u64) -> O) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let op = build(sequence);
        debug_assert_eq!(op.sequence(), sequence);
        self.ops.push_back(op);
        sequence
    }

    /// 按序号取记录；已退场或未签发时返回 `None`。
    pub fn get_mut(&mut self, sequence: u64) -> Option<&mut O> {
        let index = self.index_of(sequence)?;
        self.ops.get_mut(index)
    }

    fn index_of(&self, sequence: u64) -> Option<usize> {
        let index = sequence.checked_sub(self.head_sequence)?;
        let index = usize::try_from(index).ok()?;
        (index < self.ops.len()).then_some(index)
    }

    /// 从 `sequence` 开始向后级联推进。
    pub fn advance<F>(&mut self, sequence: u64, mut advance_one: F)
    where
        F: FnMut(&mut O, Option<O::State>) -> bool,
    {
        if let Some(mut index) = self.index_of(sequence) {
            loop {
                let prev_state = match index.checked_sub(1) {
                    Some(prev) => Some(self.ops[prev].state()),
                    None => None,
                };
                let moved = advance_one(&mut self.ops[index], prev_state);
                index += 1;
                if !moved || index >= self.ops.len() {
                    break;
                }
            }
        }
        self.retire_finished();
    }

    /// 从队头到队尾推进每一个操作；错误排空路径使用。
    pub fn advance_all<F>(&mut self, mut advance_one: F)
    where
        F: FnMut(&mut O, Option<O::State>) -> bool,
    {
        for index in 0..self.ops.len() {
            let prev_state = match index.checked_sub(1) {
                Some(prev) => Some(self.ops[prev].state()),
                None => None,
            };
            advance_one(&mut self.ops[index], prev_state);
        }
        self.retire_finished();
    }

    fn retire_finished(&mut self) {
        while self
            .ops
            .front()
            .is_some_and(|op| op.state() == O::TERMINAL)
        {
            self.ops.pop_front();
            self.head_sequence += 1;
        }
    }
}

impl<O: Operation> Default for OpQueue<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
    enum TestState {
        Pending,
        Running,
        Done,
    }

    struct TestOp {
        sequence: u64,
        state: TestState,
        ready: bool,
    }

    impl Operation for TestOp {
        type State = TestState;
        const TERMINAL: TestState = TestState::Done;

        fn sequence(&self) -> u64 {
            self.sequence
        }
        fn state(&self) -> TestState {
            self.state
        }
        fn set_state(&mut self, next: TestState) {
            self.state = next;
        }
    }

    fn advance_one(op: &mut TestOp, prev: Option<TestState>) -> bool {
        let ready = op.ready;
        let mut moved = false;
        moved |= attempt(
            op,
            TestState::Pending,
            TestState::Running,
            prev_at_least(prev, TestState::Running),
            |_| {},
        );
        moved |= attempt(op, TestState::Running, TestState::Done, ready, |_| {});
        moved
    }

    #[test]
    fn sequences_are_monotonic_from_zero() {
        let mut queue: OpQueue<TestOp> = OpQueue::new();
        for expected in 0..4 {
            let seq = queue.emplace_back(|sequence| TestOp {
                sequence,
                state: TestState::Pending,
                ready: false,
            });
            assert_eq!(seq, expected);
        }
    }

    #[test]
    fn advance_cascades_to_unblocked_successors() {
        let mut queue: OpQueue<TestOp> = OpQueue::new();
        for _ in 0..3 {
            queue.emplace_back(|sequence| TestOp {
                sequence,
                state: TestState::Pending,
                ready: false,
            });
        }
        queue.advance(0, advance_one);
        // 队头越过 Pending 后，后继应当被级联带到 Running。
        for seq in 0..3 {
            assert_eq!(queue.get_mut(seq).unwrap().state, TestState::Running);
        }
    }

    #[test]
    fn terminal_head_ops_are_retired_in_order() {
        let mut queue: OpQueue<TestOp> = OpQueue::new();
        for _ in 0..3 {
            queue.emplace_back(|sequence| TestOp {
                sequence,
                state: TestState::Pending,
                ready: false,
            });
        }
        queue.advance(0, advance_one);
        queue.get_mut(1).unwrap().ready = true;
        queue.advance(1, advance_one);
        // 序号 1 已就绪但不是队头，必须等序号 0 退场。
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.get_mut(1).unwrap().state, TestState::Done);
        queue.get_mut(0).unwrap().ready = true;
        queue.advance(0, advance_one);
        assert_eq!(queue.len(), 1);
        assert!(queue.get_mut(0).is_none());
        assert!(queue.get_mut(1).is_none());
        assert_eq!(queue.get_mut(2).unwrap().sequence, 2);
    }

    #[test]
    fn advancing_a_retired_sequence_is_a_no_op() {
        let mut queue: OpQueue<TestOp> = OpQueue::new();
        queue.emplace_back(|sequence| TestOp {
            sequence,
            state: TestState::Pending,
            ready: true,
        });
        queue.advance(0, advance_one);
        assert!(queue.is_empty());
        queue.advance(0, advance_one);
    }
}
