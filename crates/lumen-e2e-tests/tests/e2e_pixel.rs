mod common;

use lumen_ir::DataType;
use lumen_opt::OptLevel;
use lumen_pixel::{PixelBackend, PixelBackendConfig, SoftwareDevice};

fn backend() -> PixelBackend<SoftwareDevice> {
    PixelBackend::new(SoftwareDevice::default(), PixelBackendConfig::default())
}

#[test]
fn optimized_weights_round_trip_through_textures() {
    let mut model = common::mlp_model();
    common::optimize(&mut model, OptLevel::O2);

    let mut backend = backend();
    for constant in &model.constants {
        if constant.data_type != DataType::Float {
            continue;
        }
        let tensor = model.constant_tensor(&constant.name).unwrap();
        let rank = tensor.shape().rank();
        backend
            .upload(&constant.name, &tensor, rank.checked_sub(1))
            .unwrap();
        if rank > 0 {
            backend.pin(&constant.name, Some(0)).unwrap();
        }
        assert_eq!(backend.download(&constant.name).unwrap(), tensor);
    }
    assert_eq!(backend.device().texture_count(), model.constants.len());
    backend.release_all();
    assert_eq!(backend.device().texture_count(), 0);
}

#[test]
fn cpu_results_keep_their_values_across_layouts() {
    let model = common::mlp_model();
    let outputs = lumen_cpu::run_model(&model, &common::mlp_feeds()).unwrap();
    let out = &outputs["out"];

    let mut backend = backend();
    backend.upload("out", out, None).unwrap();
    backend.upload("bias", &common::ramp(&[5], 1.1), Some(0)).unwrap();

    // The bias is blocked, so the activation follows it on its last axis.
    assert_eq!(backend.pin_both_same("out", "bias").unwrap(), (1, 0));
    assert_eq!(&backend.download("out").unwrap(), out);
}

#[test]
fn wide_activations_use_several_texture_rows() {
    let tensor = common::ramp(&[1, 16, 40, 40], 0.0);
    let mut backend = backend();
    let layout = *backend.upload("act", &tensor, Some(1)).unwrap();
    assert_eq!(layout.blocked_shape().dims(), [1, 4, 40, 40]);
    assert!(layout.height() > 1);
    assert!(layout.width() * layout.height() >= 4 * 40 * 40);
    assert_eq!(backend.download("act").unwrap(), tensor);
}
