#![doc = "weft-core: 点对点张量传输内核的契约与引擎。"]
#![doc = ""]
#![doc = "== 体系综述 =="]
#![doc = "调用方在一端提交发送（指针、长度、可选的设备流），同步拿到一枚可序列化的描述符；"]
#![doc = "描述符经带外途径送达对端，对端以它提交接收，两侧共同使字节出现在目标位置，"]
#![doc = "各自以一次回调收尾。本 crate 收拢与后端无关的部分："]
#![doc = "单线程事件循环、关闭广播、上下文骨架、操作队列与条件转移引擎、"]
#![doc = "传输与通道契约、控制消息的确定性编码。"]
#![doc = ""]
#![doc = "具体搬运机制（TCP 控制流、主机内存、CUDA IPC）由同一工作空间内的后端 crate 提供，"]
#![doc = "它们只是同一状态机在不同动作集合下的实例。"]

pub mod channel;
pub mod closing;
pub mod context;
pub mod error;
pub mod event_loop;
pub mod machine;
pub mod transport;
pub mod wire;

pub use channel::{Channel, Descriptor, RecvCallback, SendCallback};
pub use closing::{ClosingEmitter, ClosingReceiver};
pub use context::ContextCore;
pub use error::{channel_closed, codes, context_closed, listener_closed, ErrorSlot, WeftError};
pub use event_loop::EventLoop;
pub use machine::{attempt, prev_at_least, OpQueue, Operation};
pub use transport::{
    split_scheme_of_url, AcceptCallback, Connection, Listener, ListenerBackend, ReadCallback,
    WriteCallback,
};
pub use wire::{WireReader, WireWriter};
