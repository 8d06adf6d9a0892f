//! Instance records and their per-frame storage
//!
//! Records are pooled across frames. A [`ModelTypeTable`] owns the records created for
//! one mesh during the current frame and hands them back to the pool at frame reset.

mod model_type;
mod pool;
mod record;

pub use model_type::ModelTypeTable;
pub use pool::InstanceRecordPool;
pub use record::{InstanceRecord, ModelData, PartData};
