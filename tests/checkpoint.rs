use std::path::PathBuf;

use gradpipe::checkpoint::{load_parameters, read_snapshot, save_parameters};
use gradpipe::{Device, Error, Shape};
use pretty_assertions::assert_eq;

fn device() -> Device {
    let _ = env_logger::builder().is_test(true).try_init();
    Device::cpu().unwrap()
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("gradpipe-{}-{name}.gpck", std::process::id()))
}

#[test]
fn test_round_trip_restores_values() {
    let device = device();
    let w = device
        .new_parameter("w", Shape::matrix(2, 2), &[0.5, -1.0, 2.0, 3.5])
        .unwrap();
    let b = device.new_parameter("b", Shape::vector(2), &[0.25, 0.0]).unwrap();
    let path = temp_path("round-trip");

    save_parameters(&path, &[w.clone(), b.clone()]).unwrap();
    w.set_values(&[0.0; 4]);
    b.set_values(&[9.0, 9.0]);
    load_parameters(&path, &[b.clone(), w.clone()]).unwrap();

    assert_eq!(w.values(), vec![0.5, -1.0, 2.0, 3.5]);
    assert_eq!(b.values(), vec![0.25, 0.0]);

    let entries = read_snapshot(&path).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "w");
    assert_eq!(entries[0].shape, Shape::matrix(2, 2));
    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_missing_parameter_fails_without_writing() {
    let device = device();
    let w = device.new_parameter("w", Shape::vector(2), &[1.0, 2.0]).unwrap();
    let path = temp_path("missing");
    save_parameters(&path, &[w.clone()]).unwrap();

    let other = device.new_parameter("other", Shape::vector(1), &[7.0]).unwrap();
    w.set_values(&[0.0, 0.0]);
    let err = load_parameters(&path, &[w.clone(), other]).unwrap_err();
    assert!(matches!(err, Error::MissingParameter(ref name) if name == "other"));
    assert_eq!(w.values(), vec![0.0, 0.0]);
    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_shape_mismatch_is_rejected() {
    let device = device();
    let saved = device.new_parameter("w", Shape::vector(4), &[1.0; 4]).unwrap();
    let path = temp_path("shape");
    save_parameters(&path, &[saved]).unwrap();

    let reshaped = device.new_parameter("w", Shape::matrix(2, 2), &[0.0; 4]).unwrap();
    let err = load_parameters(&path, &[reshaped.clone()]).unwrap_err();
    assert!(matches!(err, Error::ParameterShape { ref name, .. } if name == "w"));
    assert_eq!(reshaped.values(), vec![0.0; 4]);
    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_unnamed_tensor_cannot_be_saved() {
    let device = device();
    let w = device.new_parameter("w", Shape::vector(2), &[1.0, 2.0]).unwrap();
    let x = device.new_data_with_values(Shape::vector(1), &[1.0]).unwrap();
    let path = temp_path("unnamed");
    save_parameters(&path, &[w.clone()]).unwrap();

    w.set_values(&[5.0, 6.0]);
    let err = save_parameters(&path, &[w, x]).unwrap_err();
    assert!(matches!(err, Error::UnnamedParameter));

    let entries = read_snapshot(&path).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "w");
    assert_eq!(entries[0].data, vec![1.0, 2.0]);
    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_foreign_file_is_rejected() {
    let path = temp_path("foreign");
    std::fs::write(&path, b"not a snapshot").unwrap();
    let err = read_snapshot(&path).unwrap_err();
    assert!(matches!(err, Error::Checkpoint(_)), "{err}");
    std::fs::remove_file(path).unwrap();
}

#[test]
fn test_truncated_file_is_an_io_error() {
    let device = device();
    let w = device.new_parameter("w", Shape::vector(8), &[1.0; 8]).unwrap();
    let path = temp_path("truncated");
    save_parameters(&path, &[w]).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 6]).unwrap();

    let err = read_snapshot(&path).unwrap_err();
    assert!(matches!(err, Error::Io(_)), "{err}");
    std::fs::remove_file(path).unwrap();
}
