pub mod change;
pub mod gate;
