//! Integration tests for configuration loading.

use std::io::Write;

use nano_cb::config::{DecoderStrategy, ModelConfig, PadSide, SchedulerConfig};
use nano_cb::Error;

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "num_cache_slots": 4,
            "max_input_seq_len": 32,
            "max_decode_steps": 10,
            "seq_len_buckets": [8, 16, 32],
            "batch_size_buckets": [1, 2, 4],
            "eos_ids": [2, 3],
            "pad_side": "right"
        }}"#
    )
    .unwrap();

    let config = SchedulerConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.num_cache_slots, 4);
    assert_eq!(config.max_decode_steps, 10);
    assert_eq!(config.pad_side, PadSide::Right);
    assert!(config.is_eos(3));
    assert!(!config.is_eos(1));
    // Unset fields keep their defaults.
    assert_eq!(config.max_admissions_per_tick, 1);
    assert_eq!(config.pad_id, 0);
}

#[test]
fn test_invalid_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"num_cache_slots": 16}}"#).unwrap();

    // Default batch buckets stop at 8.
    assert!(matches!(
        SchedulerConfig::from_json_file(file.path()),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_malformed_json() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{ not json").unwrap();

    assert!(matches!(
        SchedulerConfig::from_json_file(file.path()),
        Err(Error::Json(_))
    ));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = SchedulerConfig::from_json_file(dir.path().join("missing.json"));
    assert!(matches!(result, Err(Error::Io(_))));
}

#[test]
fn test_seq_bucket_must_cover_max_input() {
    let config = SchedulerConfig {
        max_input_seq_len: 200,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_model_config_round_trip() {
    let config = ModelConfig {
        decoder: DecoderStrategy::Sample {
            temperature: 0.7,
            top_k: 5,
            top_p: 0.9,
            seed: 3,
        },
        ..Default::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    let parsed: ModelConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.decoder, config.decoder);
    assert_eq!(parsed.vocab_size, config.vocab_size);
}

#[test]
fn test_model_config_rejects_bad_top_p() {
    let config = ModelConfig {
        decoder: DecoderStrategy::Sample {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.5,
            seed: 0,
        },
        ..Default::default()
    };
    assert!(config.validate().is_err());
}
