/// Tunable knobs for the growable memory mappings backing the index and data files.
///
/// This is in-process configuration handed to [`crate::store::Store::init`] by
/// the caller; it is not a file format and nothing here is loaded from disk or from
/// an external config file.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Size, in bytes, a freshly created file is mapped at before anything is written.
    pub initial_map_size: usize,
    /// Once the mapping exceeds `growth_increment`, it grows linearly by this amount
    /// instead of doubling. Mirrors the teacher crate's `ONE_GIB` doubling-then-linear
    /// growth policy, scaled down for the smaller node/value sizes in this format.
    pub growth_increment: usize,
}

const DEFAULT_INITIAL_MAP_SIZE: usize = 1 << 20; // 1 MiB
const DEFAULT_GROWTH_INCREMENT: usize = 1 << 30; // 1 GiB

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            initial_map_size: DEFAULT_INITIAL_MAP_SIZE,
            growth_increment: DEFAULT_GROWTH_INCREMENT,
        }
    }
}
