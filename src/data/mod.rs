/// Data layer: core types and volume I/O.
///
/// Architecture:
/// ```text
///  .nii / .nii.gz / .json
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  parse file → Volume (array + spatial frame)
///   └──────────┘
///        │
///        ▼
///   ┌───────────────────────────┐
///   │ ComponentSet / SubjectStack │  trailing axis = component / subject
///   └───────────────────────────┘
///        │
///        ▼
///   ┌──────────────┐
///   │ ResultMatrix  │  components × subjects, rows committed once
///   └──────────────┘
/// ```

pub mod loader;
pub mod model;
