use fcnet_rs::{
    checkpoint::{Checkpoint, CheckpointError, load_checkpoint, save_checkpoint},
    nn::{Module, Network},
    tensor::Tensor,
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

const INPUT_SIZE: usize = 784;
const OUTPUT_SIZE: usize = 10;

fn assert_bit_identical(a: &Network, b: &Network) {
    let (a, b) = (a.state_dict(), b.state_dict());
    assert_eq!(
        a.keys().collect::<Vec<_>>(),
        b.keys().collect::<Vec<_>>()
    );
    for (name, tensor) in a.iter() {
        assert!(tensor.bit_eq(&b[name]), "{name} differs");
    }
}

#[test]
fn mnist_sized_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("classifier.fcn");

    let model = Network::with_seed(INPUT_SIZE, OUTPUT_SIZE, &[512, 256, 128], 0.5, 42).unwrap();
    save_checkpoint(&model, &path).unwrap();

    let restored = load_checkpoint(&path).unwrap();
    assert_eq!(restored.input_size(), INPUT_SIZE);
    assert_eq!(restored.output_size(), OUTPUT_SIZE);
    assert_eq!(restored.hidden_layers(), &[512, 256, 128]);
    assert_eq!(restored.drop_p(), 0.5);
    assert_bit_identical(&model, &restored);
}

#[test]
fn mnist_sized_load_into_other_widths_fails() {
    let model = Network::with_seed(INPUT_SIZE, OUTPUT_SIZE, &[512, 256, 128], 0.5, 42).unwrap();
    let checkpoint = Checkpoint::from_model(&model);

    let mut target =
        Network::with_seed(INPUT_SIZE, OUTPUT_SIZE, &[400, 200, 100], 0.5, 7).unwrap();
    let before = target.state_dict();

    let err = checkpoint.load_into(&mut target).unwrap_err();
    let CheckpointError::ShapeMismatch {
        mismatches,
        missing,
        unexpected,
    } = &err
    else {
        panic!("expected a shape mismatch, got {err}");
    };
    // same depth, so every slot exists on both sides
    assert!(missing.is_empty() && unexpected.is_empty());
    let report = mismatches
        .iter()
        .map(|m| (m.name.as_str(), m.expected.clone(), m.actual.clone()))
        .collect::<Vec<_>>();
    assert_eq!(
        report,
        vec![
            ("hidden_layers.0.bias", vec![400], vec![512]),
            ("hidden_layers.0.weight", vec![400, 784], vec![512, 784]),
            ("hidden_layers.1.bias", vec![200], vec![256]),
            ("hidden_layers.1.weight", vec![200, 400], vec![256, 512]),
            ("hidden_layers.2.bias", vec![100], vec![128]),
            ("hidden_layers.2.weight", vec![100, 200], vec![128, 256]),
            // the output layer's fan-in follows the last hidden width
            ("output.weight", vec![10, 100], vec![10, 128]),
        ]
    );

    // nothing was written into the target
    let after = target.state_dict();
    for (name, tensor) in before.iter() {
        assert!(tensor.bit_eq(&after[name]), "{name} was modified");
    }
}

#[test]
fn arbitrary_values_round_trip_bit_exact() {
    let mut rng = Pcg64Mcg::seed_from_u64(99);
    for hidden in [vec![], vec![3], vec![5, 1, 4]] {
        let model = Network::with_seed(6, 3, &hidden, 0.0, rng.random()).unwrap();
        // overwrite with arbitrary bit patterns, NaNs and infinities included
        let state = model
            .state_dict()
            .into_iter()
            .map(|(name, t)| {
                let data = (0..t.numel())
                    .map(|_| f32::from_bits(rng.random()))
                    .collect();
                (name, Tensor::new(t.shape().to_vec(), data).unwrap())
            })
            .collect();
        let mut checkpoint = Checkpoint::from_model(&model);
        checkpoint.parameters = state;

        let mut buf = vec![];
        checkpoint.write_to(&mut buf).unwrap();
        let decoded = Checkpoint::read_from(&mut buf.as_slice()).unwrap();
        let restored = decoded.into_model().unwrap();

        for (name, tensor) in checkpoint.parameters.iter() {
            assert!(
                tensor.bit_eq(&restored.state_dict()[name]),
                "{hidden:?}: {name} differs"
            );
        }
    }
}

#[test]
fn restored_model_predicts_like_the_original() {
    let model = Network::with_seed(4, 3, &[8, 8], 0.3, 1).unwrap();
    let restored = Checkpoint::from_model(&model).into_model().unwrap();
    model.eval();
    restored.eval();

    let inputs = [0.1, -0.4, 2.0, 0.7].map(fcnet_rs::values::Value::new);
    let a = model.forward(&inputs).unwrap();
    let b = restored.forward(&inputs).unwrap();
    let a = a.iter().map(|v| v.data().to_bits()).collect::<Vec<_>>();
    let b = b.iter().map(|v| v.data().to_bits()).collect::<Vec<_>>();
    assert_eq!(a, b);
}

#[test]
fn load_into_other_depth_is_a_shape_mismatch() {
    let shallow = Network::with_seed(4, 3, &[6], 0.5, 1).unwrap();
    let deep = Network::with_seed(4, 3, &[6, 6], 0.5, 2).unwrap();

    // one hidden layer stored, two expected
    let mut target = Network::with_seed(4, 3, &[6, 6], 0.5, 3).unwrap();
    let before = target.state_dict();
    let err = Checkpoint::from_model(&shallow)
        .load_into(&mut target)
        .unwrap_err();
    let CheckpointError::ShapeMismatch {
        mismatches,
        missing,
        unexpected,
    } = &err
    else {
        panic!("expected a shape mismatch, got {err}");
    };
    assert!(mismatches.is_empty());
    assert_eq!(missing, &["hidden_layers.1.bias", "hidden_layers.1.weight"]);
    assert!(unexpected.is_empty());
    assert_eq!(target.state_dict(), before);

    // two hidden layers stored, one expected
    let mut target = Network::with_seed(4, 3, &[6], 0.5, 4).unwrap();
    let before = target.state_dict();
    let err = Checkpoint::from_model(&deep)
        .load_into(&mut target)
        .unwrap_err();
    let CheckpointError::ShapeMismatch {
        mismatches,
        missing,
        unexpected,
    } = &err
    else {
        panic!("expected a shape mismatch, got {err}");
    };
    assert!(mismatches.is_empty());
    assert!(missing.is_empty());
    assert_eq!(unexpected, &["hidden_layers.1.bias", "hidden_layers.1.weight"]);
    assert_eq!(target.state_dict(), before);
}
