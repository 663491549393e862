use lumen_ir::Tensor;
use lumen_pixel::{
    Binding, DispatchDomain, Kernel, KernelInvocation, LayoutError, PixelBackend,
    PixelBackendConfig, SoftwareDevice, TextureStore,
};

/// `x = x * scale + bias[i % bias.len()]` over the first `count` values.
#[derive(Debug)]
struct Affine;

impl Kernel for Affine {
    fn name(&self) -> &'static str {
        "Affine"
    }

    fn run(&self, textures: &mut TextureStore, invocation: &KernelInvocation) -> Result<(), LayoutError> {
        let (id, layout) = invocation.texture("x")?;
        textures.check_layout(id, layout)?;
        let missing = |binding: &str| LayoutError::MissingBinding {
            kernel: invocation.kernel.clone(),
            binding: binding.to_string(),
        };
        let Some(&Binding::Scalar(scale)) = invocation.bindings.get("scale") else {
            return Err(missing("scale"));
        };
        let Some(Binding::IntVec(bias)) = invocation.bindings.get("bias") else {
            return Err(missing("bias"));
        };
        let Some(&Binding::Int(count)) = invocation.bindings.get("count") else {
            return Err(missing("count"));
        };
        let texels = textures.texels_mut(id)?;
        for (i, v) in texels.iter_mut().take(count as usize).enumerate() {
            *v = *v * scale + bias[i % bias.len()] as f32;
        }
        Ok(())
    }
}

fn backend() -> PixelBackend<SoftwareDevice> {
    let mut device = SoftwareDevice::default();
    device.register_kernel(Box::new(Affine));
    PixelBackend::new(device, PixelBackendConfig::default())
}

#[test]
fn registered_kernel_sees_uniforms() {
    let mut backend = backend();
    let x = Tensor::from_f32(&[6], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    backend.upload("x", &x, None).unwrap();

    let invocation = KernelInvocation::new("Affine", DispatchDomain::Linear(6))
        .bind("x", backend.binding("x").unwrap())
        .bind("scale", Binding::Scalar(2.0))
        .bind("bias", Binding::IntVec(vec![0, 10]))
        .bind("count", Binding::Int(6));
    backend.dispatch(&invocation).unwrap();

    let y = backend.download("x").unwrap();
    assert_eq!(y.as_f32().unwrap(), [2.0, 14.0, 6.0, 18.0, 10.0, 22.0]);
}

#[test]
fn wrong_binding_kind_is_rejected() {
    let mut backend = backend();
    backend
        .upload("x", &Tensor::from_f32(&[4], vec![0.0; 4]).unwrap(), None)
        .unwrap();
    let invocation = KernelInvocation::new("Affine", DispatchDomain::Linear(4))
        .bind("x", backend.binding("x").unwrap())
        .bind("scale", Binding::Int(2));
    let err = backend.dispatch(&invocation).unwrap_err();
    assert_eq!(err.to_string(), "kernel 'Affine' is missing binding 'scale'");
}

#[test]
fn registering_twice_replaces_the_kernel() {
    let mut device = SoftwareDevice::default();
    device.register_kernel(Box::new(Affine));
    device.register_kernel(Box::new(Affine));
    assert!(format!("{device:?}").contains("[\"SwitchBlockedLayout\", \"Affine\"]"));
}
