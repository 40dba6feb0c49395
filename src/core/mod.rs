//! 核心编排层：请求与结果信封、阶段与状态、通信通道、改进循环、编排器

pub mod channel;
pub mod error;
pub mod orchestrator;
pub mod refinement;
pub mod request;
pub mod result;
pub mod state;

pub use channel::{
    AgentMessage, CommunicationChannel, Delivery, MessagePayload, MessageType, BROADCAST, ORCHESTRATOR,
};
pub use error::{AgentError, PipelineError};
pub use orchestrator::{AgentSet, Orchestrator, PipelineOptions, PipelineOutput, PresentationView};
pub use refinement::{RefinementContext, RefinementExit, RefinementLoop, RefinementOutcome};
pub use request::{PipelineRequest, DEFAULT_QUALITY_THRESHOLD, DEFAULT_START_CHAPTER, MAX_CHAPTER_COUNT};
pub use result::AgentResult;
pub use state::{AgentStatus, PipelineStage, StatusRecord};
