//! Domain models shared by the Status Client and the controller.

pub mod instance;
pub mod response;
pub mod state;
