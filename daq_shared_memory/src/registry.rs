//! Signal and parameter registration.
//!
//! Paths share one namespace; signals and parameters have separate dense
//! index spaces. Storage is a byte offset into the [`ProcessImage`].
//! After [`VariableRegistry::finalize`] the registry is immutable and is
//! shared as `Arc<VariableRegistry>`.
//!
//! [`ProcessImage`]: crate::image::ProcessImage

use crate::error::{SetupError, SetupResult};
use bitflags::bitflags;
use daq::layout::ElementLayout;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Access rights of a parameter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessMode: u32 {
        /// Value may be read by sessions.
        const READ  = 0x0001;
        /// Value may be written by sessions.
        const WRITE = 0x0002;
        /// Read and write.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl Default for AccessMode {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

/// Arguments of a parameter update callback.
pub struct ParameterUpdate<'a> {
    /// Task committing the value
    pub task_id: usize,
    /// `true` for the non-real-time validation pass, `false` for the commit
    pub check_only: bool,
    /// Destination bytes: a copy of the current value when checking, the
    /// live process image range when committing
    pub dst: &'a mut [u8],
    /// New value
    pub src: &'a [u8],
}

/// Validation/commit hook. Returns 0 on success or a negative error code.
pub type ParameterCallback = Arc<dyn Fn(&mut ParameterUpdate<'_>) -> i32 + Send + Sync>;

/// Callback used when none is registered: accept and copy.
pub fn raw_copy(update: &mut ParameterUpdate<'_>) -> i32 {
    if !update.check_only {
        update.dst.copy_from_slice(update.src);
    }
    0
}

/// Fields shared by signals and parameters.
#[derive(Debug, Clone)]
pub struct VariableInfo {
    /// Unique path, always starting with '/'
    pub path: String,
    /// Optional short name
    pub alias: Option<String>,
    /// Optional engineering unit
    pub unit: Option<String>,
    /// Optional description
    pub comment: Option<String>,
    /// Binary shape
    pub layout: ElementLayout,
    /// Byte offset into the process image
    pub offset: usize,
}

impl VariableInfo {
    /// Byte range in the process image.
    #[inline]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.layout.byte_size()
    }
}

/// A read-only value produced by one task.
#[derive(Debug, Clone)]
pub struct Signal {
    /// Signal index
    pub index: usize,
    /// Producing task
    pub task_id: usize,
    /// Task ticks between meaningful samples (>= 1)
    pub decimation: u32,
    /// Common fields
    pub info: VariableInfo,
}

/// A writable tunable.
#[derive(Clone)]
pub struct Parameter {
    /// Parameter index
    pub index: usize,
    /// Access rights
    pub access: AccessMode,
    /// Update hook, `None` means [`raw_copy`]
    pub callback: Option<ParameterCallback>,
    /// Common fields
    pub info: VariableInfo,
}

impl Parameter {
    /// Run the update hook.
    pub fn update(&self, update: &mut ParameterUpdate<'_>) -> i32 {
        match &self.callback {
            Some(cb) => cb(update),
            None => raw_copy(update),
        }
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("index", &self.index)
            .field("access", &self.access)
            .field("callback", &self.callback.is_some())
            .field("info", &self.info)
            .finish()
    }
}

/// Result of a path lookup.
#[derive(Debug, Clone, Copy)]
pub enum Variable<'a> {
    /// Signal
    Signal(&'a Signal),
    /// Parameter
    Parameter(&'a Parameter),
}

impl<'a> Variable<'a> {
    /// Common fields.
    pub fn info(&self) -> &'a VariableInfo {
        match self {
            Self::Signal(s) => &s.info,
            Self::Parameter(p) => &p.info,
        }
    }

    /// Index within the variable's own kind.
    pub fn index(&self) -> usize {
        match self {
            Self::Signal(s) => s.index,
            Self::Parameter(p) => p.index,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Signal(usize),
    Parameter(usize),
}

/// Registry of every signal and parameter.
#[derive(Debug)]
pub struct VariableRegistry {
    task_count: usize,
    image_limit: Option<usize>,
    signals: Vec<Signal>,
    parameters: Vec<Parameter>,
    paths: HashMap<String, Slot>,
    finalized: bool,
}

impl VariableRegistry {
    /// Registry for `task_count` tasks; the process image is sized from the
    /// registrations.
    pub fn new(task_count: usize) -> Self {
        Self {
            task_count,
            image_limit: None,
            signals: Vec::new(),
            parameters: Vec::new(),
            paths: HashMap::new(),
            finalized: false,
        }
    }

    /// Registry whose storage must fit in an image of `image_len` bytes.
    pub fn with_image_limit(task_count: usize, image_len: usize) -> Self {
        Self {
            image_limit: Some(image_len),
            ..Self::new(task_count)
        }
    }

    fn check_new(&self, path: &str, layout: &ElementLayout, offset: usize) -> SetupResult<()> {
        if self.finalized {
            return Err(SetupError::RegistryFinalized {
                path: path.to_string(),
            });
        }
        if !path.starts_with('/') || path.len() < 2 {
            return Err(SetupError::InvalidPath {
                path: path.to_string(),
            });
        }
        if self.paths.contains_key(path) {
            return Err(SetupError::DuplicatePath {
                path: path.to_string(),
            });
        }
        let alignment = layout.element_width();
        if offset % alignment != 0 {
            return Err(SetupError::AlignmentError {
                path: path.to_string(),
                offset,
                alignment,
            });
        }
        if let Some(image_len) = self.image_limit {
            let size = layout.byte_size();
            if offset.checked_add(size).is_none_or(|end| end > image_len) {
                return Err(SetupError::StorageOutOfBounds {
                    path: path.to_string(),
                    offset,
                    size,
                    image_len,
                });
            }
        }
        Ok(())
    }

    fn info(path: &str, layout: ElementLayout, offset: usize) -> VariableInfo {
        VariableInfo {
            path: path.to_string(),
            alias: None,
            unit: None,
            comment: None,
            layout,
            offset,
        }
    }

    /// Register a signal produced by `task_id`. Decimation 0 counts as 1.
    pub fn register_signal(
        &mut self,
        path: &str,
        task_id: usize,
        decimation: u32,
        layout: ElementLayout,
        offset: usize,
    ) -> SetupResult<usize> {
        self.check_new(path, &layout, offset)?;
        if task_id >= self.task_count {
            return Err(SetupError::UnknownTask {
                path: path.to_string(),
                task_id,
            });
        }
        let index = self.signals.len();
        self.signals.push(Signal {
            index,
            task_id,
            decimation: decimation.max(1),
            info: Self::info(path, layout, offset),
        });
        self.paths.insert(path.to_string(), Slot::Signal(index));
        tracing::debug!(path, index, task_id, "signal registered");
        Ok(index)
    }

    /// Register a parameter. `callback = None` installs [`raw_copy`].
    pub fn register_parameter(
        &mut self,
        path: &str,
        access: AccessMode,
        layout: ElementLayout,
        offset: usize,
        callback: Option<ParameterCallback>,
    ) -> SetupResult<usize> {
        self.check_new(path, &layout, offset)?;
        let index = self.parameters.len();
        self.parameters.push(Parameter {
            index,
            access,
            callback,
            info: Self::info(path, layout, offset),
        });
        self.paths.insert(path.to_string(), Slot::Parameter(index));
        tracing::debug!(path, index, "parameter registered");
        Ok(index)
    }

    /// Find a variable by path.
    pub fn lookup(&self, path: &str) -> SetupResult<Variable<'_>> {
        match self.paths.get(path) {
            Some(Slot::Signal(i)) => Ok(Variable::Signal(&self.signals[*i])),
            Some(Slot::Parameter(i)) => Ok(Variable::Parameter(&self.parameters[*i])),
            None => Err(SetupError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    fn info_mut(&mut self, path: &str) -> SetupResult<&mut VariableInfo> {
        if self.finalized {
            return Err(SetupError::RegistryFinalized {
                path: path.to_string(),
            });
        }
        match self.paths.get(path) {
            Some(Slot::Signal(i)) => Ok(&mut self.signals[*i].info),
            Some(Slot::Parameter(i)) => Ok(&mut self.parameters[*i].info),
            None => Err(SetupError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    /// Set the alias of a variable.
    pub fn set_alias(&mut self, path: &str, alias: &str) -> SetupResult<()> {
        self.info_mut(path)?.alias = Some(alias.to_string());
        Ok(())
    }

    /// Set the unit of a variable.
    pub fn set_unit(&mut self, path: &str, unit: &str) -> SetupResult<()> {
        self.info_mut(path)?.unit = Some(unit.to_string());
        Ok(())
    }

    /// Set the comment of a variable.
    pub fn set_comment(&mut self, path: &str, comment: &str) -> SetupResult<()> {
        self.info_mut(path)?.comment = Some(comment.to_string());
        Ok(())
    }

    /// Forbid further registration and metadata changes.
    pub fn finalize(&mut self) {
        if !self.finalized {
            self.finalized = true;
            tracing::info!(
                signals = self.signals.len(),
                parameters = self.parameters.len(),
                image_len = self.image_len(),
                "variable registry finalized"
            );
        }
    }

    /// Whether [`finalize`](Self::finalize) was called.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Number of tasks.
    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// Signal by index.
    #[inline]
    pub fn signal(&self, index: usize) -> Option<&Signal> {
        self.signals.get(index)
    }

    /// Parameter by index.
    #[inline]
    pub fn parameter(&self, index: usize) -> Option<&Parameter> {
        self.parameters.get(index)
    }

    /// All signals in index order.
    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    /// All parameters in index order.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Signals produced by `task_id`.
    pub fn signals_of_task(&self, task_id: usize) -> impl Iterator<Item = &Signal> {
        self.signals.iter().filter(move |s| s.task_id == task_id)
    }

    /// Bytes of process image needed to back every registered variable.
    pub fn image_len(&self) -> usize {
        let end = self
            .signals
            .iter()
            .map(|s| s.info.range().end)
            .chain(self.parameters.iter().map(|p| p.info.range().end))
            .max()
            .unwrap_or(0);
        self.image_limit.map_or(end, |limit| limit.max(end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq::layout::PrimitiveType;

    fn f64_scalar() -> ElementLayout {
        ElementLayout::scalar(PrimitiveType::F64)
    }

    #[test]
    fn test_indices_per_kind() {
        let mut reg = VariableRegistry::new(2);
        assert_eq!(reg.register_signal("/a", 0, 1, f64_scalar(), 0).unwrap(), 0);
        assert_eq!(
            reg.register_parameter("/p", AccessMode::default(), f64_scalar(), 8, None)
                .unwrap(),
            0
        );
        assert_eq!(reg.register_signal("/b", 1, 0, f64_scalar(), 16).unwrap(), 1);
        assert_eq!(reg.signal(1).unwrap().decimation, 1);
        assert_eq!(reg.signals_of_task(1).count(), 1);
        assert_eq!(reg.image_len(), 24);
    }

    #[test]
    fn test_paths_unique_across_kinds() {
        let mut reg = VariableRegistry::new(1);
        reg.register_signal("/x", 0, 1, f64_scalar(), 0).unwrap();
        let err = reg
            .register_parameter("/x", AccessMode::READ, f64_scalar(), 8, None)
            .unwrap_err();
        assert!(matches!(err, SetupError::DuplicatePath { path } if path == "/x"));
    }

    #[test]
    fn test_lookup() {
        let mut reg = VariableRegistry::new(1);
        reg.register_signal("/x", 0, 1, f64_scalar(), 0).unwrap();
        reg.register_parameter("/k", AccessMode::WRITE, f64_scalar(), 8, None)
            .unwrap();

        assert!(matches!(reg.lookup("/x"), Ok(Variable::Signal(s)) if s.index == 0));
        assert!(matches!(reg.lookup("/k"), Ok(Variable::Parameter(p)) if p.info.offset == 8));
        assert!(matches!(reg.lookup("/nope"), Err(SetupError::NotFound { .. })));
    }

    #[test]
    fn test_finalize_freezes() {
        let mut reg = VariableRegistry::new(1);
        reg.register_signal("/x", 0, 1, f64_scalar(), 0).unwrap();
        reg.set_unit("/x", "m/s").unwrap();
        reg.finalize();

        assert!(matches!(
            reg.register_signal("/y", 0, 1, f64_scalar(), 8),
            Err(SetupError::RegistryFinalized { .. })
        ));
        assert!(matches!(
            reg.set_alias("/x", "speed"),
            Err(SetupError::RegistryFinalized { .. })
        ));
        let Variable::Signal(sig) = reg.lookup("/x").unwrap() else {
            panic!("expected signal");
        };
        assert_eq!(sig.info.unit.as_deref(), Some("m/s"));
        assert_eq!(sig.info.alias, None);
    }

    #[test]
    fn test_rejects_bad_registrations() {
        let mut reg = VariableRegistry::with_image_limit(1, 16);
        assert!(matches!(
            reg.register_signal("x", 0, 1, f64_scalar(), 0),
            Err(SetupError::InvalidPath { .. })
        ));
        assert!(matches!(
            reg.register_signal("/x", 1, 1, f64_scalar(), 0),
            Err(SetupError::UnknownTask { task_id: 1, .. })
        ));
        assert!(matches!(
            reg.register_signal("/x", 0, 1, f64_scalar(), 4),
            Err(SetupError::AlignmentError { alignment: 8, .. })
        ));
        assert!(matches!(
            reg.register_signal("/x", 0, 1, f64_scalar(), 16),
            Err(SetupError::StorageOutOfBounds { image_len: 16, .. })
        ));
        assert!(reg.register_signal("/x", 0, 1, f64_scalar(), 8).is_ok());
        assert_eq!(reg.image_len(), 16);
    }

    #[test]
    fn test_default_callback_copies_on_commit() {
        let src = [1u8, 2, 3];
        let mut dst = [0u8; 3];
        let mut check = ParameterUpdate {
            task_id: 0,
            check_only: true,
            dst: &mut dst,
            src: &src,
        };
        assert_eq!(raw_copy(&mut check), 0);
        assert_eq!(dst, [0, 0, 0]);

        let mut commit = ParameterUpdate {
            task_id: 0,
            check_only: false,
            dst: &mut dst,
            src: &src,
        };
        assert_eq!(raw_copy(&mut commit), 0);
        assert_eq!(dst, src);
    }
}
