//! 流式事件：事件类型与轨迹翻译

pub mod events;
pub mod translator;

pub use events::{DispatchStatus, StreamEvent, SubagentDispatch};
pub use translator::StreamTranslator;
