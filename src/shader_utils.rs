use log::{error, info};
use std::borrow::Cow;
use std::path::{Path, PathBuf};

use crate::error::SetupError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Compute,
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn to_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Compute => naga::ShaderStage::Compute,
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        }
    }
}

/// A `(group, binding)` pair a named shader resource is bound at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UniformLocation {
    pub group: u32,
    pub binding: u32,
}

/// A compiled shader object: the validated module plus the source it came
/// from, which is kept for diagnostics and for handing to the device.
#[derive(Debug)]
pub struct Shader {
    pub stage: ShaderStage,
    pub path: PathBuf,
    pub source: String,
    entry_point: String,
    module: naga::Module,
}

impl Shader {
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn create_module(&self, device: &wgpu::Device) -> wgpu::ShaderModule {
        device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: self.path.to_str(),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&self.source)),
        })
    }

    fn entry(&self) -> Option<&naga::EntryPoint> {
        self.module
            .entry_points
            .iter()
            .find(|ep| ep.name == self.entry_point)
    }

    // Named resource bindings declared at module scope.
    fn resources(&self) -> impl Iterator<Item = (&str, naga::AddressSpace, UniformLocation)> + '_ {
        self.module
            .global_variables
            .iter()
            .filter_map(|(_, var)| {
                let name = var.name.as_deref()?;
                let binding = var.binding.as_ref()?;
                Some((
                    name,
                    var.space,
                    UniformLocation {
                        group: binding.group,
                        binding: binding.binding,
                    },
                ))
            })
    }

    // User-defined inter-stage locations this entry point reads.
    fn input_locations(&self) -> Vec<u32> {
        self.entry()
            .map(|ep| {
                ep.function
                    .arguments
                    .iter()
                    .flat_map(|arg| io_locations(&self.module, arg.ty, arg.binding.as_ref()))
                    .collect()
            })
            .unwrap_or_default()
    }

    // User-defined inter-stage locations this entry point writes.
    fn output_locations(&self) -> Vec<u32> {
        self.entry()
            .and_then(|ep| ep.function.result.as_ref())
            .map(|result| io_locations(&self.module, result.ty, result.binding.as_ref()))
            .unwrap_or_default()
    }
}

fn io_locations(
    module: &naga::Module,
    ty: naga::Handle<naga::Type>,
    binding: Option<&naga::Binding>,
) -> Vec<u32> {
    match binding {
        Some(naga::Binding::Location { location, .. }) => vec![*location],
        Some(naga::Binding::BuiltIn(_)) => vec![],
        None => match &module.types[ty].inner {
            naga::TypeInner::Struct { members, .. } => members
                .iter()
                .filter_map(|member| match member.binding {
                    Some(naga::Binding::Location { location, .. }) => Some(location),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        },
    }
}

/// Reads a WGSL file and compiles it for `stage`.
pub fn load<P: AsRef<Path>>(path: P, stage: ShaderStage) -> Result<Shader, SetupError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|source| SetupError::ShaderIo {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Loading {:?} shader {}", stage, path.display());
    compile(path, source, stage)
}

/// Parses and validates `source`, and checks it has an entry point for
/// `stage`. Errors carry the full source along with the compiler log.
pub fn compile<P: AsRef<Path>>(
    path: P,
    source: String,
    stage: ShaderStage,
) -> Result<Shader, SetupError> {
    let path = path.as_ref().to_path_buf();
    let module = match naga::front::wgsl::parse_str(&source) {
        Ok(module) => module,
        Err(e) => {
            let log = e.emit_to_string(&source);
            return Err(compile_failure(path, source, log));
        }
    };
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    if let Err(e) = validator.validate(&module) {
        let log = e.emit_to_string(&source);
        return Err(compile_failure(path, source, log));
    }
    let entry_point = match module
        .entry_points
        .iter()
        .find(|ep| ep.stage == stage.to_naga())
    {
        Some(ep) => ep.name.clone(),
        None => {
            let log = format!("no {:?} entry point", stage);
            return Err(compile_failure(path, source, log));
        }
    };
    Ok(Shader {
        stage,
        path,
        source,
        entry_point,
        module,
    })
}

fn compile_failure(path: PathBuf, text: String, log: String) -> SetupError {
    error!("Error during shader compilation of {}", path.display());
    SetupError::ShaderCompile { path, text, log }
}

// A set of shaders linked into one program, plus the storage slots of the
// buffers associated with it.
#[derive(Debug)]
pub struct ShaderProgram {
    pub label: String,
    shaders: Vec<Shader>,
    buffers: Vec<u32>,
    linked: bool,
}

impl ShaderProgram {
    pub fn create(label: &str) -> Self {
        ShaderProgram {
            label: label.to_string(),
            shaders: Vec::new(),
            buffers: Vec::new(),
            linked: false,
        }
    }

    pub fn attach(&mut self, shader: Shader) {
        self.linked = false;
        self.shaders.push(shader);
    }

    /// Associates the buffer bound at storage slot `binding` with this
    /// program.
    pub fn add_buffer(&mut self, binding: u32) {
        if !self.buffers.contains(&binding) {
            self.buffers.push(binding);
        }
    }

    pub fn buffers(&self) -> &[u32] {
        &self.buffers
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Fails unless [`ShaderProgram::link`] succeeded since the last attach.
    pub fn require_linked(&self) -> Result<(), SetupError> {
        if self.linked {
            return Ok(());
        }
        Err(SetupError::Link {
            program: self.label.clone(),
            log: "program is not linked".to_string(),
        })
    }

    /// Checks that the attached stages form a complete program and that they
    /// agree on their shared interface.
    pub fn link(&mut self) -> Result<(), SetupError> {
        let stages: Vec<ShaderStage> = self.shaders.iter().map(|s| s.stage).collect();
        match stages.as_slice() {
            [ShaderStage::Compute] => {}
            [ShaderStage::Vertex, ShaderStage::Fragment]
            | [ShaderStage::Fragment, ShaderStage::Vertex] => self.link_graphics()?,
            [] => return Err(self.link_failure("no shaders attached".to_string())),
            _ => {
                return Err(
                    self.link_failure(format!("cannot link stage combination {:?}", stages))
                )
            }
        }

        for (i, a) in self.shaders.iter().enumerate() {
            for b in &self.shaders[i + 1..] {
                for (name, space, location) in a.resources() {
                    let conflict = b
                        .resources()
                        .find(|(other, other_space, other_location)| {
                            *other == name
                                && (*other_location != location || *other_space != space)
                        });
                    if conflict.is_some() {
                        return Err(self.link_failure(format!(
                            "'{}' is declared differently in {} and {}",
                            name,
                            a.path.display(),
                            b.path.display()
                        )));
                    }
                }
            }
        }

        info!(
            "Linked program '{}' ({} shaders)",
            self.label,
            self.shaders.len()
        );
        self.linked = true;
        Ok(())
    }

    fn link_graphics(&self) -> Result<(), SetupError> {
        let (vertex, fragment) = match (
            self.stage(ShaderStage::Vertex),
            self.stage(ShaderStage::Fragment),
        ) {
            (Some(v), Some(f)) => (v, f),
            _ => return Err(self.link_failure("missing vertex or fragment stage".to_string())),
        };
        let outputs = vertex.output_locations();
        for location in fragment.input_locations() {
            if !outputs.contains(&location) {
                return Err(self.link_failure(format!(
                    "fragment input @location({}) is not written by {}",
                    location,
                    vertex.path.display()
                )));
            }
        }
        Ok(())
    }

    fn link_failure(&self, log: String) -> SetupError {
        error!("Failed to link program '{}': {}", self.label, log);
        SetupError::Link {
            program: self.label.clone(),
            log,
        }
    }

    pub fn stage(&self, stage: ShaderStage) -> Option<&Shader> {
        self.shaders.iter().find(|s| s.stage == stage)
    }

    /// Location of the `var<uniform>` called `name` in any attached stage.
    pub fn uniform_location(&self, name: &str) -> Option<UniformLocation> {
        self.find_resource(name, |space| space == naga::AddressSpace::Uniform)
    }

    /// Location of the `var<storage>` called `name` in any attached stage.
    pub fn storage_location(&self, name: &str) -> Option<UniformLocation> {
        self.find_resource(name, |space| {
            matches!(space, naga::AddressSpace::Storage { .. })
        })
    }

    fn find_resource(
        &self,
        name: &str,
        space_matches: impl Fn(naga::AddressSpace) -> bool,
    ) -> Option<UniformLocation> {
        self.shaders.iter().find_map(|shader| {
            shader
                .resources()
                .find(|(n, space, _)| *n == name && space_matches(*space))
                .map(|(_, _, location)| location)
        })
    }

    pub fn workgroup_size(&self) -> Option<[u32; 3]> {
        self.stage(ShaderStage::Compute)
            .and_then(|shader| shader.entry())
            .map(|ep| ep.workgroup_size)
    }

    /// Like [`ShaderProgram::uniform_location`], but a missing uniform is an
    /// interface error.
    pub fn require_uniform(&self, name: &str) -> Result<UniformLocation, SetupError> {
        self.uniform_location(name)
            .ok_or_else(|| SetupError::Interface {
                program: self.label.clone(),
                detail: format!("no uniform named '{}'", name),
            })
    }

    /// Checks that the storage buffer `name` sits at `expected` in group 0.
    pub fn require_storage(&self, name: &str, expected: u32) -> Result<(), SetupError> {
        match self.storage_location(name) {
            Some(UniformLocation { group: 0, binding }) if binding == expected => Ok(()),
            found => Err(SetupError::Interface {
                program: self.label.clone(),
                detail: format!(
                    "storage buffer '{}' must be at @group(0) @binding({}), found {:?}",
                    name, expected, found
                ),
            }),
        }
    }
}
