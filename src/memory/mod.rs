//! 记忆层：目标指纹与肌肉记忆（已验证例程的持久缓存）

pub mod fingerprint;
pub mod routine;

pub use fingerprint::{
    covers_all_params, materialize, templatize, Fingerprint, Fingerprinter, LexicalFingerprinter,
    StepTemplate,
};
pub use routine::{MuscleMemory, Routine, SqliteRoutineStore};
