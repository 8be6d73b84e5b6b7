//! Shared image + semaphore pair, created on the low-level side and imported
//! into GL.
//!
//! The algorithm is platform neutral: a [`SharedResourceBackend`] performs
//! each native step and [`SharedResourceBinder::bind`] sequences them. Every
//! object created so far lives in a staging set until the bind completes,
//! so a failure at any step releases exactly what was created, newest first.
//!
//! Exported OS handles follow the import ownership rules of their type: file
//! descriptors move into GL on a successful import, NT handles stay with the
//! exporter and are closed right after, KMT handles are never closed.

use gl::types::{GLenum, GLuint};
use tracing::{debug, error, info};

use crate::error::{BindStep, InteropError, NativeCode};
use crate::format::{ColorFormat, Extent};
use crate::probe::{
    require_compatible, ExternalHandleProvider, ExternalHandleType, HandleKind, HandleSupport,
    NativeHandle,
};

/// Creation parameters of the shared image. The GL texture must report
/// exactly these back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedImageDesc {
    pub extent: Extent,
    pub format: ColorFormat,
}

/// Level-0 parameters read back from an imported GL texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub extent: Extent,
    pub internal_format: GLenum,
}

/// A freshly allocated exportable image.
#[derive(Debug)]
pub struct ExportedImage<I> {
    pub image: I,
    /// Allocation size; GL needs it to import the memory.
    pub size: u64,
    pub dedicated: bool,
}

/// Pick a memory type allowed by `type_bits` whose property flags contain
/// `preferred`; if none does, relax to any allowed type.
pub fn select_memory_type(type_bits: u32, property_flags: &[u32], preferred: u32) -> Option<u32> {
    let allowed = |i: usize| i < 32 && type_bits & (1 << i) != 0;

    property_flags
        .iter()
        .enumerate()
        .find(|&(i, &flags)| allowed(i) && flags & preferred == preferred)
        .or_else(|| {
            property_flags
                .iter()
                .enumerate()
                .find(|&(i, _)| allowed(i))
        })
        .map(|(i, _)| i as u32)
}

/// Native steps of a bind.
pub trait SharedResourceBackend: ExternalHandleProvider + Sized {
    /// Exportable low-level semaphore.
    type Semaphore;
    /// Exportable low-level image with its bound memory.
    type Image;
    /// GL memory object.
    type MemoryObject;
    /// GL texture backed by the memory object.
    type Texture;
    /// GL semaphore.
    type ImportedSemaphore;
    /// GL framebuffer with the texture as color attachment.
    type RenderTarget;

    fn semaphore_support(&self, ty: ExternalHandleType) -> HandleSupport;
    fn memory_support(&self, ty: ExternalHandleType, desc: &SharedImageDesc) -> HandleSupport;

    fn create_export_semaphore(
        &mut self,
        ty: ExternalHandleType,
    ) -> Result<Self::Semaphore, InteropError>;
    fn export_semaphore(
        &mut self,
        semaphore: &Self::Semaphore,
        ty: ExternalHandleType,
    ) -> Result<NativeHandle, InteropError>;
    fn destroy_semaphore(&mut self, semaphore: Self::Semaphore);

    fn create_export_image(
        &mut self,
        desc: &SharedImageDesc,
        ty: ExternalHandleType,
    ) -> Result<ExportedImage<Self::Image>, InteropError>;
    fn export_memory(
        &mut self,
        image: &Self::Image,
        ty: ExternalHandleType,
    ) -> Result<NativeHandle, InteropError>;
    fn destroy_image(&mut self, image: Self::Image);

    fn import_memory(
        &mut self,
        handle: NativeHandle,
        ty: ExternalHandleType,
        size: u64,
        dedicated: bool,
    ) -> Result<Self::MemoryObject, InteropError>;
    fn delete_memory_object(&mut self, memory: Self::MemoryObject);

    fn import_texture(
        &mut self,
        memory: &Self::MemoryObject,
        desc: &SharedImageDesc,
    ) -> Result<Self::Texture, InteropError>;
    fn texture_info(&mut self, texture: &Self::Texture) -> TextureInfo;
    fn delete_texture(&mut self, texture: Self::Texture);

    fn import_semaphore(
        &mut self,
        handle: NativeHandle,
        ty: ExternalHandleType,
    ) -> Result<Self::ImportedSemaphore, InteropError>;
    fn delete_imported_semaphore(&mut self, semaphore: Self::ImportedSemaphore);

    fn create_render_target(
        &mut self,
        texture: &Self::Texture,
    ) -> Result<Self::RenderTarget, InteropError>;
    fn delete_render_target(&mut self, target: Self::RenderTarget);
    fn framebuffer_name(&self, target: &Self::RenderTarget) -> GLuint;

    /// Close an exported handle that GL did not take ownership of.
    fn close_handle(&mut self, handle: NativeHandle);

    /// Move the new image into its handoff layout and signal "ready" once,
    /// so the first legacy-side wait has something to consume.
    fn prime(&mut self, shared: &SharedResources<Self>) -> Result<(), InteropError>;
}

/// Everything one successful bind produced.
pub struct SharedResources<B: SharedResourceBackend> {
    /// Increments with every successful bind.
    pub generation: u64,
    pub desc: SharedImageDesc,
    pub size: u64,
    pub semaphore_type: ExternalHandleType,
    pub memory_type: ExternalHandleType,
    pub image: B::Image,
    pub ready: B::Semaphore,
    pub complete: B::Semaphore,
    pub memory: B::MemoryObject,
    pub texture: B::Texture,
    pub gl_ready: B::ImportedSemaphore,
    pub gl_complete: B::ImportedSemaphore,
    pub target: B::RenderTarget,
}

impl<B: SharedResourceBackend> SharedResources<B> {
    fn into_staging(self) -> Staging<B> {
        Staging {
            ready: Some(self.ready),
            complete: Some(self.complete),
            image: Some(self.image),
            memory: Some(self.memory),
            texture: Some(self.texture),
            gl_ready: Some(self.gl_ready),
            gl_complete: Some(self.gl_complete),
            target: Some(self.target),
            pending: Vec::new(),
        }
    }
}

/// Objects created by an in-progress bind.
struct Staging<B: SharedResourceBackend> {
    ready: Option<B::Semaphore>,
    complete: Option<B::Semaphore>,
    image: Option<B::Image>,
    memory: Option<B::MemoryObject>,
    texture: Option<B::Texture>,
    gl_ready: Option<B::ImportedSemaphore>,
    gl_complete: Option<B::ImportedSemaphore>,
    target: Option<B::RenderTarget>,
    /// Exported handles not yet handed to GL.
    pending: Vec<(NativeHandle, ExternalHandleType)>,
}

impl<B: SharedResourceBackend> Default for Staging<B> {
    fn default() -> Self {
        Self {
            ready: None,
            complete: None,
            image: None,
            memory: None,
            texture: None,
            gl_ready: None,
            gl_complete: None,
            target: None,
            pending: Vec::new(),
        }
    }
}

impl<B: SharedResourceBackend> Staging<B> {
    /// GL objects first, then the native objects they borrow from.
    fn release(mut self, backend: &mut B) {
        if let Some(target) = self.target.take() {
            backend.delete_render_target(target);
        }
        if let Some(sem) = self.gl_complete.take() {
            backend.delete_imported_semaphore(sem);
        }
        if let Some(sem) = self.gl_ready.take() {
            backend.delete_imported_semaphore(sem);
        }
        if let Some(texture) = self.texture.take() {
            backend.delete_texture(texture);
        }
        if let Some(memory) = self.memory.take() {
            backend.delete_memory_object(memory);
        }
        if let Some(image) = self.image.take() {
            backend.destroy_image(image);
        }
        if let Some(sem) = self.complete.take() {
            backend.destroy_semaphore(sem);
        }
        if let Some(sem) = self.ready.take() {
            backend.destroy_semaphore(sem);
        }
        for (handle, ty) in self.pending.drain(..) {
            if ty.is_fd() || ty.exporter_closes() {
                backend.close_handle(handle);
            }
        }
    }
}

/// Map a backend failure onto the bind step it happened in. Failures that are
/// already typed pass through.
fn at_step(step: BindStep) -> impl FnOnce(InteropError) -> InteropError {
    move |err| match err {
        InteropError::Native { detail, code } => InteropError::bind(step, detail, code),
        InteropError::FrameAcquireFailed { detail, code }
        | InteropError::SubmitFailed { detail, code } => InteropError::bind(step, detail, code),
        other => other,
    }
}

/// Hand an exported handle to a GL import and settle its ownership.
fn import_handle<B, T>(
    backend: &mut B,
    pending: &mut Vec<(NativeHandle, ExternalHandleType)>,
    handle: NativeHandle,
    ty: ExternalHandleType,
    import: impl FnOnce(&mut B) -> Result<T, InteropError>,
) -> Result<T, InteropError>
where
    B: SharedResourceBackend,
{
    let result = import(backend);
    if result.is_ok() {
        pending.retain(|(h, _)| *h != handle);
        if ty.exporter_closes() {
            backend.close_handle(handle);
        }
    }
    result
}

/// Owns the currently bound [`SharedResources`].
pub struct SharedResourceBinder<B: SharedResourceBackend> {
    bound: Option<SharedResources<B>>,
    generation: u64,
}

impl<B: SharedResourceBackend> Default for SharedResourceBinder<B> {
    fn default() -> Self {
        Self {
            bound: None,
            generation: 0,
        }
    }
}

impl<B: SharedResourceBackend> SharedResourceBinder<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bound(&self) -> Option<&SharedResources<B>> {
        self.bound.as_ref()
    }

    /// Generation of the last successful bind (0 before the first).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Release the current set, if any. Idempotent.
    pub fn unbind(&mut self, backend: &mut B) {
        if let Some(shared) = self.bound.take() {
            debug!("releasing shared resources generation {}", shared.generation);
            shared.into_staging().release(backend);
        }
    }

    /// Replace the current set with a new one for `desc`.
    pub fn bind(
        &mut self,
        backend: &mut B,
        desc: SharedImageDesc,
    ) -> Result<&SharedResources<B>, InteropError> {
        self.unbind(backend);

        if desc.extent.is_empty() {
            return Err(InteropError::bind(
                BindStep::ImageCreate,
                format!("zero-sized extent {}x{}", desc.extent.width, desc.extent.height),
                NativeCode::None,
            ));
        }
        if !desc.format.is_shareable() {
            return Err(InteropError::bind(
                BindStep::ImageCreate,
                format!("{} has no GL equivalent", desc.format.name()),
                NativeCode::None,
            ));
        }

        let mut staging = Staging::default();
        match self.build(backend, desc, &mut staging) {
            Ok(shared) => {
                info!(
                    "shared resources bound: {}x{} {}, {} bytes, generation {}",
                    desc.extent.width,
                    desc.extent.height,
                    desc.format.name(),
                    shared.size,
                    shared.generation
                );
                self.generation = shared.generation;
                let shared: &SharedResources<B> = self.bound.insert(shared);
                Ok(shared)
            }
            Err(err) => {
                error!("shared resource bind failed: {err}");
                staging.release(backend);
                Err(err)
            }
        }
    }

    fn build(
        &self,
        backend: &mut B,
        desc: SharedImageDesc,
        staging: &mut Staging<B>,
    ) -> Result<SharedResources<B>, InteropError> {
        // Semaphores.
        let candidates = backend.semaphore_candidates().to_vec();
        let semaphore_type = require_compatible(HandleKind::Semaphore, &candidates, |ty| {
            backend.semaphore_support(ty)
        })?;
        debug!("semaphore handle type {semaphore_type:?}");

        let ready = backend
            .create_export_semaphore(semaphore_type)
            .map_err(at_step(BindStep::SemaphoreCreate))?;
        let ready = staging.ready.insert(ready);
        let ready_handle = backend
            .export_semaphore(ready, semaphore_type)
            .map_err(at_step(BindStep::SemaphoreExport))?;
        staging.pending.push((ready_handle, semaphore_type));

        let complete = backend
            .create_export_semaphore(semaphore_type)
            .map_err(at_step(BindStep::SemaphoreCreate))?;
        let complete = staging.complete.insert(complete);
        let complete_handle = backend
            .export_semaphore(complete, semaphore_type)
            .map_err(at_step(BindStep::SemaphoreExport))?;
        staging.pending.push((complete_handle, semaphore_type));

        // Image and memory.
        let candidates = backend.memory_candidates().to_vec();
        let memory_type = require_compatible(HandleKind::Memory, &candidates, |ty| {
            backend.memory_support(ty, &desc)
        })?;
        debug!("memory handle type {memory_type:?}");

        let exported = backend
            .create_export_image(&desc, memory_type)
            .map_err(at_step(BindStep::ImageCreate))?;
        let size = exported.size;
        let dedicated = exported.dedicated;
        let image = staging.image.insert(exported.image);
        let memory_handle = backend
            .export_memory(image, memory_type)
            .map_err(at_step(BindStep::MemoryExport))?;
        staging.pending.push((memory_handle, memory_type));

        // GL side.
        let memory = import_handle(
            backend,
            &mut staging.pending,
            memory_handle,
            memory_type,
            |b| b.import_memory(memory_handle, memory_type, size, dedicated),
        )
        .map_err(at_step(BindStep::MemoryImport))?;
        let memory = staging.memory.insert(memory);

        let texture = backend
            .import_texture(memory, &desc)
            .map_err(at_step(BindStep::TextureImport))?;
        let texture = staging.texture.insert(texture);

        let info = backend.texture_info(texture);
        let expected = TextureInfo {
            extent: desc.extent,
            internal_format: desc.format.gl_internal_format().unwrap_or_default(),
        };
        if info != expected {
            return Err(InteropError::bind(
                BindStep::TextureMismatch,
                format!("imported texture reports {info:?}, image was created as {expected:?}"),
                NativeCode::None,
            ));
        }

        let gl_ready = import_handle(
            backend,
            &mut staging.pending,
            ready_handle,
            semaphore_type,
            |b| b.import_semaphore(ready_handle, semaphore_type),
        )
        .map_err(at_step(BindStep::SemaphoreImport))?;
        staging.gl_ready = Some(gl_ready);

        let gl_complete = import_handle(
            backend,
            &mut staging.pending,
            complete_handle,
            semaphore_type,
            |b| b.import_semaphore(complete_handle, semaphore_type),
        )
        .map_err(at_step(BindStep::SemaphoreImport))?;
        staging.gl_complete = Some(gl_complete);

        let target = backend
            .create_render_target(texture)
            .map_err(at_step(BindStep::RenderTarget))?;
        staging.target = Some(target);

        let shared = assemble(
            staging,
            self.generation + 1,
            desc,
            size,
            semaphore_type,
            memory_type,
        )?;

        if let Err(err) = backend.prime(&shared) {
            *staging = shared.into_staging();
            return Err(at_step(BindStep::Prime)(err));
        }
        Ok(shared)
    }
}

/// Move a complete staging set into [`SharedResources`]. An incomplete set
/// is put back untouched so the caller can release it.
fn assemble<B: SharedResourceBackend>(
    staging: &mut Staging<B>,
    generation: u64,
    desc: SharedImageDesc,
    size: u64,
    semaphore_type: ExternalHandleType,
    memory_type: ExternalHandleType,
) -> Result<SharedResources<B>, InteropError> {
    let staged = std::mem::take(staging);
    let pending = staged.pending;
    match (
        staged.ready,
        staged.complete,
        staged.image,
        staged.memory,
        staged.texture,
        staged.gl_ready,
        staged.gl_complete,
        staged.target,
    ) {
        (
            Some(ready),
            Some(complete),
            Some(image),
            Some(memory),
            Some(texture),
            Some(gl_ready),
            Some(gl_complete),
            Some(target),
        ) => {
            staging.pending = pending;
            Ok(SharedResources {
                generation,
                desc,
                size,
                semaphore_type,
                memory_type,
                image,
                ready,
                complete,
                memory,
                texture,
                gl_ready,
                gl_complete,
                target,
            })
        }
        (ready, complete, image, memory, texture, gl_ready, gl_complete, target) => {
            *staging = Staging {
                ready,
                complete,
                image,
                memory,
                texture,
                gl_ready,
                gl_complete,
                target,
                pending,
            };
            Err(InteropError::bind(
                BindStep::RenderTarget,
                "bind finished with missing objects",
                NativeCode::None,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_LOCAL: u32 = 0x1;
    const HOST_VISIBLE: u32 = 0x2;

    #[test]
    fn preferred_memory_type_wins() {
        let flags = [HOST_VISIBLE, DEVICE_LOCAL, DEVICE_LOCAL | HOST_VISIBLE];
        assert_eq!(select_memory_type(0b111, &flags, DEVICE_LOCAL), Some(1));
        assert_eq!(select_memory_type(0b100, &flags, DEVICE_LOCAL), Some(2));
    }

    #[test]
    fn memory_type_relaxes_to_any_allowed() {
        let flags = [HOST_VISIBLE, HOST_VISIBLE];
        assert_eq!(select_memory_type(0b10, &flags, DEVICE_LOCAL), Some(1));
    }

    /// Backend that only records what gets released.
    #[derive(Default)]
    struct Tracker {
        released: Vec<&'static str>,
        closed: Vec<NativeHandle>,
    }

    fn unused<T>() -> Result<T, InteropError> {
        Err(InteropError::native("not used here", NativeCode::None))
    }

    impl ExternalHandleProvider for Tracker {
        fn semaphore_candidates(&self) -> &[ExternalHandleType] {
            &[ExternalHandleType::OpaqueFd]
        }

        fn memory_candidates(&self) -> &[ExternalHandleType] {
            &[ExternalHandleType::OpaqueFd]
        }
    }

    impl SharedResourceBackend for Tracker {
        type Semaphore = u32;
        type Image = u32;
        type MemoryObject = u32;
        type Texture = u32;
        type ImportedSemaphore = u32;
        type RenderTarget = u32;

        fn semaphore_support(&self, _: ExternalHandleType) -> HandleSupport {
            HandleSupport::default()
        }
        fn memory_support(&self, _: ExternalHandleType, _: &SharedImageDesc) -> HandleSupport {
            HandleSupport::default()
        }
        fn create_export_semaphore(&mut self, _: ExternalHandleType) -> Result<u32, InteropError> {
            unused()
        }
        fn export_semaphore(
            &mut self,
            _: &u32,
            _: ExternalHandleType,
        ) -> Result<NativeHandle, InteropError> {
            unused()
        }
        fn destroy_semaphore(&mut self, _: u32) {
            self.released.push("semaphore");
        }
        fn create_export_image(
            &mut self,
            _: &SharedImageDesc,
            _: ExternalHandleType,
        ) -> Result<ExportedImage<u32>, InteropError> {
            unused()
        }
        fn export_memory(
            &mut self,
            _: &u32,
            _: ExternalHandleType,
        ) -> Result<NativeHandle, InteropError> {
            unused()
        }
        fn destroy_image(&mut self, _: u32) {
            self.released.push("image");
        }
        fn import_memory(
            &mut self,
            _: NativeHandle,
            _: ExternalHandleType,
            _: u64,
            _: bool,
        ) -> Result<u32, InteropError> {
            unused()
        }
        fn delete_memory_object(&mut self, _: u32) {
            self.released.push("memory_object");
        }
        fn import_texture(&mut self, _: &u32, _: &SharedImageDesc) -> Result<u32, InteropError> {
            unused()
        }
        fn texture_info(&mut self, _: &u32) -> TextureInfo {
            TextureInfo {
                extent: Extent::MIN,
                internal_format: 0,
            }
        }
        fn delete_texture(&mut self, _: u32) {
            self.released.push("texture");
        }
        fn import_semaphore(
            &mut self,
            _: NativeHandle,
            _: ExternalHandleType,
        ) -> Result<u32, InteropError> {
            unused()
        }
        fn delete_imported_semaphore(&mut self, _: u32) {
            self.released.push("gl_semaphore");
        }
        fn create_render_target(&mut self, _: &u32) -> Result<u32, InteropError> {
            unused()
        }
        fn delete_render_target(&mut self, _: u32) {
            self.released.push("render_target");
        }
        fn framebuffer_name(&self, target: &u32) -> GLuint {
            *target
        }
        fn close_handle(&mut self, handle: NativeHandle) {
            self.closed.push(handle);
        }
        fn prime(&mut self, _: &SharedResources<Self>) -> Result<(), InteropError> {
            Ok(())
        }
    }

    #[test]
    fn incomplete_staging_is_kept_for_release() {
        let mut backend = Tracker::default();
        let mut staging = Staging::<Tracker> {
            ready: Some(1),
            complete: Some(2),
            image: Some(3),
            ..Staging::default()
        };
        staging
            .pending
            .push((NativeHandle::Fd(9), ExternalHandleType::OpaqueFd));
        let desc = SharedImageDesc {
            extent: Extent::MIN,
            format: ColorFormat::Rgba8Unorm,
        };

        let result = assemble(
            &mut staging,
            1,
            desc,
            64,
            ExternalHandleType::OpaqueFd,
            ExternalHandleType::OpaqueFd,
        );
        assert!(matches!(
            result,
            Err(InteropError::SharedResourceBindFailed { .. })
        ));

        staging.release(&mut backend);
        assert_eq!(backend.released, ["image", "semaphore", "semaphore"]);
        assert_eq!(backend.closed, [NativeHandle::Fd(9)]);
    }

    #[test]
    fn memory_type_none_when_nothing_allowed() {
        let flags = [DEVICE_LOCAL];
        assert_eq!(select_memory_type(0, &flags, DEVICE_LOCAL), None);
        assert_eq!(select_memory_type(0b1, &[], DEVICE_LOCAL), None);
    }
}
