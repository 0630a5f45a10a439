pub mod cli;
pub mod nes;
