mod events;

pub use events::RescheduleEventListener;
