pub mod advertise;
pub mod capabilities;
pub mod list;
pub mod push;
