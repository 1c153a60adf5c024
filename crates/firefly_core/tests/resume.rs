//! Checkpoint and resume: an interrupted run continues from disk and
//! reproduces the uninterrupted result.

use std::fs;
use std::path::PathBuf;

use serial_test::serial;

use firefly_core::{FFInt, RationalFunction, Reconstructor};

fn bb(point: &[FFInt]) -> Vec<FFInt> {
    vec![(point[0] + point[1]) / (point[0] * point[1] + FFInt::one())]
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(name);
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn uninterrupted_result() -> RationalFunction {
    let mut reconstructor = Reconstructor::new(2, 2, bb);
    reconstructor.set_seed(101);
    reconstructor.reconstruct(10).unwrap();
    reconstructor.get_result().remove(0)
}

#[test]
#[serial]
fn resume_after_interruption() {
    let expected = uninterrupted_result();

    let save_dir = temp_dir("firefly_resume_test");

    // First run, allowed a single prime field only: it checkpoints the
    // completed first prime and fails at the promotion.
    {
        let mut reconstructor = Reconstructor::new(2, 2, bb);
        reconstructor.set_seed(101);
        reconstructor.set_save_dir(save_dir.clone());
        reconstructor.set_tags(vec!["f".to_string()]);
        assert!(reconstructor.reconstruct(1).is_err());
    }

    assert!(save_dir.join("validation.gz").exists());
    assert!(save_dir.join("anchor_points").exists());
    assert!(save_dir.join("shift").exists());
    assert!(save_dir.join("states/0_1.gz").exists());
    assert!(save_dir.join("probes/0_0.gz").exists());

    // Relaunch: load the checkpoint, replay the validation probe, finish.
    {
        let mut reconstructor = Reconstructor::new(2, 2, bb);
        reconstructor.set_seed(202);
        reconstructor.set_save_dir(save_dir.clone());
        reconstructor.resume_from_saved_state().unwrap();
        reconstructor.reconstruct(10).unwrap();

        let results = reconstructor.get_result();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].numerator, expected.numerator);
        assert_eq!(results[0].denominator, expected.denominator);
    }

    let _ = fs::remove_dir_all(&save_dir);
}

#[test]
#[serial]
fn resume_rejects_wrong_black_box() {
    let save_dir = temp_dir("firefly_resume_mismatch_test");

    {
        let mut reconstructor = Reconstructor::new(2, 2, bb);
        reconstructor.set_seed(303);
        reconstructor.set_save_dir(save_dir.clone());
        reconstructor.set_tags(vec!["f".to_string()]);
        assert!(reconstructor.reconstruct(1).is_err());
    }

    // A different black box must fail the validation replay.
    let wrong_bb = |point: &[FFInt]| vec![point[0] + point[1]];
    let mut reconstructor = Reconstructor::new(2, 2, wrong_bb);
    reconstructor.set_save_dir(save_dir.clone());
    let err = reconstructor.resume_from_saved_state();
    assert!(err.is_err());

    let _ = fs::remove_dir_all(&save_dir);
}

#[test]
#[serial]
fn resume_without_states_fails() {
    let save_dir = temp_dir("firefly_resume_empty_test");
    fs::create_dir_all(&save_dir).unwrap();

    let mut reconstructor = Reconstructor::new(2, 2, bb);
    reconstructor.set_save_dir(save_dir.clone());
    assert!(reconstructor.resume_from_saved_state().is_err());

    let _ = fs::remove_dir_all(&save_dir);
}
