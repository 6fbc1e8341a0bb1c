mod in_memory_reading_sink;
mod reading;
mod reading_sink;
mod result;

pub use in_memory_reading_sink::*;
pub use reading::*;
pub use reading_sink::*;
pub use result::*;
