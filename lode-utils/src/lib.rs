pub mod bit_misc;
pub mod elf;
pub mod uleb;
pub mod utils;
