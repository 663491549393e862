use lumen_ir::Tensor;
use lumen_pixel::{LayoutError, PixelBackend, PixelBackendConfig, SoftwareDevice};

fn backend() -> PixelBackend<SoftwareDevice> {
    PixelBackend::new(SoftwareDevice::default(), PixelBackendConfig::default())
}

fn ramp(dims: &[usize]) -> Tensor {
    let n = dims.iter().product::<usize>();
    Tensor::from_f32(dims, (0..n).map(|i| i as f32 * 0.5 - 3.0).collect()).unwrap()
}

#[test]
fn nchw_round_trip_on_channel_axis() {
    let mut backend = backend();
    let tensor = ramp(&[2, 6, 3, 5]);
    let layout = *backend.upload("x", &tensor, Some(1)).unwrap();
    assert_eq!(layout.block_axis(), Some(1));
    assert_eq!(layout.blocked_shape().dims(), [2, 2, 3, 5]);
    assert_eq!(backend.download("x").unwrap(), tensor);
    // Upload and download free their staging textures.
    assert_eq!(backend.device().texture_count(), 1);
}

#[test]
fn switching_block_axis_preserves_values() {
    let mut backend = backend();
    let tensor = ramp(&[1, 5, 7, 3]);
    backend.upload("x", &tensor, Some(1)).unwrap();
    let before = backend.texture("x").unwrap();

    let layout = *backend.pin("x", Some(2)).unwrap();
    assert_eq!(layout.block_axis(), Some(2));
    assert_eq!(layout.dim_axis(), 7);
    assert_ne!(backend.texture("x").unwrap(), before);
    assert_eq!(backend.download("x").unwrap(), tensor);
    assert_eq!(backend.device().texture_count(), 1);
}

#[test]
fn identical_layout_reuses_the_texture() {
    let mut backend = backend();
    backend.upload("x", &ramp(&[3, 8]), None).unwrap();
    let texture = backend.texture("x").unwrap();
    let layout = *backend.pin("x", Some(1)).unwrap();
    assert_eq!(layout.block_axis(), Some(1));
    assert_eq!(backend.texture("x").unwrap(), texture);
}

#[test]
fn pin_both_same_follows_the_blocked_operand() {
    let mut backend = backend();
    backend.upload("a", &ramp(&[2, 4, 6]), None).unwrap();
    backend.upload("b", &ramp(&[4, 6]), Some(0)).unwrap();

    // Only `b` is blocked: `a` follows it, one axis from the end.
    assert_eq!(backend.pin_both_same("a", "b").unwrap(), (1, 0));

    // Both blocked: `a` wins.
    backend.pin("a", Some(2)).unwrap();
    assert_eq!(backend.pin_both_same("a", "b").unwrap(), (2, 1));
    assert_eq!(backend.layout("b").unwrap().block_axis(), Some(1));
    assert_eq!(backend.download("b").unwrap(), ramp(&[4, 6]));
}

#[test]
fn pin_both_same_defaults_to_innermost_axis() {
    let mut backend = backend();
    backend.upload("a", &ramp(&[3, 5]), None).unwrap();
    backend.upload("b", &ramp(&[5]), None).unwrap();
    assert_eq!(backend.pin_both_same("a", "b").unwrap(), (1, 0));
}

#[test]
fn oversized_tensor_is_fatal() {
    let mut backend = PixelBackend::new(
        SoftwareDevice::default(),
        PixelBackendConfig {
            max_texture_size: 4,
        },
    );
    let err = backend.upload("x", &ramp(&[100]), None).unwrap_err();
    assert!(matches!(err, LayoutError::TextureTooLarge { max: 4, .. }));
    assert_eq!(backend.device().texture_count(), 0);
}

#[test]
fn release_frees_the_texture() {
    let mut backend = backend();
    backend.upload("x", &ramp(&[4]), None).unwrap();
    backend.release("x").unwrap();
    assert_eq!(backend.device().texture_count(), 0);
    assert!(matches!(backend.download("x"), Err(LayoutError::UnknownTensor(_))));
    assert!(backend.upload("x", &ramp(&[4]), None).is_ok());
}
