// Queue rules: admission, ordering, the entry state machine and the contracts
// the engine needs from storage and collaborators.

pub mod admission;
pub mod clock;
pub mod entity;
pub mod error;
pub mod event;
pub mod queue;
pub mod repository;
