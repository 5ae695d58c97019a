//! Capability buses: one registered provider per capability, reached through
//! [`BusManager`].

pub mod local;
pub mod manager;
pub mod services;
pub mod slot;

pub use local::{InMemoryMemory, LocalCommunication, LocalToolService, LocalWiseAuthority};
pub use manager::{BusManager, RetryPolicy};
pub use services::{
    CommunicationService, DeferralRequest, GuidanceRequest, MemoryEntry, MemoryService, Message,
    OutboundMessage, Service, ServiceResult, ToolResult, ToolService, WiseAuthorityService,
};
pub use slot::CapabilitySlot;
