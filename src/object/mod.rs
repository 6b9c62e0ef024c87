//! Building the output object: the section map, the object builder, and
//! the phase driver.

pub mod builder;
pub mod linker;
pub mod section_map;
