mod common;

use std::{collections::BTreeMap, sync::Arc};

use common::*;
use tts_core::{CancellationToken, SynthesisError, SynthesisRequest};

const TEXT: &str = "a. b. c. d. e. f.";

fn tags(letters: &str) -> Vec<i16> {
    letters.chars().map(|c| letter_id(c) as i16).collect()
}

#[test]
fn test_output_follows_input_order_despite_delays() {
    let mut encoder = TagEncoder::new(2);
    // Earlier sentences finish last.
    for (i, c) in "abcdef".chars().enumerate() {
        encoder.delay_ms.insert(letter_id(c), (6 - i as u64) * 15);
    }
    let encoder = Arc::new(encoder);
    let driver = driver_with(voice_config(0.01, None), encoder.clone(), 2, 3);

    let mut flushes: Vec<Vec<i16>> = Vec::new();
    let mut sink = |s: &[i16]| flushes.push(s.to_vec());
    driver
        .synthesize_streaming(&SynthesisRequest::new(TEXT), &mut sink)
        .unwrap();

    let audio: Vec<i16> = flushes.concat();
    assert_eq!(runs(&audio), tags("abcdef"));
    assert_eq!(encoder.encoded().len(), 6);
}

#[test]
fn test_streamed_audio_matches_buffered_audio() {
    let driver = driver_with(voice_config(0.05, None), Arc::new(TagEncoder::new(3)), 3, 3);
    let request = SynthesisRequest::new(TEXT);

    let (buffered, _) = driver.synthesize(&request).unwrap();
    let mut streamed: Vec<i16> = Vec::new();
    let mut calls = 0usize;
    let mut sink = |s: &[i16]| {
        calls += 1;
        streamed.extend_from_slice(s);
    };
    driver.synthesize_streaming(&request, &mut sink).unwrap();

    assert_eq!(streamed, buffered);
    // One flush per phrase plus one per sentence silence.
    assert_eq!(calls, 12);
}

#[test]
fn test_single_failure_yields_one_error_and_pool_recovers() {
    let mut encoder = TagEncoder::new(2);
    encoder.fail_tag = Some(letter_id('c'));
    let encoder = Arc::new(encoder);
    let driver = driver_with(voice_config(0.0, None), encoder.clone(), 2, 3);

    let err = driver.synthesize(&SynthesisRequest::new(TEXT)).unwrap_err();
    match err {
        SynthesisError::Inference { source, .. } => {
            assert!(source.to_string().contains(&letter_id('c').to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Every job reported back: the workers and decoder contexts are free again.
    let (audio, _) = driver.synthesize(&SynthesisRequest::new("a. b.")).unwrap();
    assert_eq!(runs(&audio), tags("ab"));
}

#[test]
fn test_later_sentences_not_replayed_after_failure() {
    let mut encoder = TagEncoder::new(2);
    encoder.fail_tag = Some(letter_id('b'));
    encoder.delay_ms.insert(letter_id('b'), 40);
    let driver = driver_with(voice_config(0.0, None), Arc::new(encoder), 2, 4);

    let mut audio: Vec<i16> = Vec::new();
    let result = driver.synthesize_streaming(&SynthesisRequest::new("a. b. c. d."), &mut audio);
    assert!(result.is_err());
    // Sentence `a` precedes the failure and may have been delivered; nothing after it is.
    assert!(runs(&audio).iter().all(|&tag| tag == letter_id('a') as i16));
}

#[test]
fn test_worker_panic_surfaces_as_error() {
    let mut encoder = TagEncoder::new(2);
    encoder.panic_tag = Some(letter_id('b'));
    let driver = driver_with(voice_config(0.0, None), Arc::new(encoder), 1, 2);

    let err = driver.synthesize(&SynthesisRequest::new("a. b. c.")).unwrap_err();
    assert!(matches!(err, SynthesisError::WorkerPool(_)));
    assert!(err.to_string().contains("panicked"));
}

#[test]
fn test_more_workers_than_contexts() {
    let encoder = Arc::new(TagEncoder::new(30));
    let driver = driver_with(voice_config(0.0, None), encoder.clone(), 1, 4);

    let text = "a. b. c. d. e. f. g. h.";
    let (audio, result) = driver.synthesize(&SynthesisRequest::new(text)).unwrap();
    assert_eq!(runs(&audio), tags("abcdefgh"));
    // 7 ids per sentence at 30 slices each.
    assert_eq!(audio.len(), 8 * 7 * 30 * SAMPLES_PER_SLICE);
    assert!(result.audio_seconds > 0.0);
    assert!(result.real_time_factor >= 0.0);
}

#[test]
fn test_cancelled_request_stops() {
    let driver = driver_with(voice_config(0.0, None), Arc::new(TagEncoder::new(2)), 1, 2);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let request = SynthesisRequest::new(TEXT).cancel_with(cancel.clone());
    let err = driver.synthesize(&request).unwrap_err();
    assert!(err.is_cancellation());
}

#[test]
fn test_phrase_silence_inserted_between_phrases() {
    let silence = BTreeMap::from([(",", 0.3)]);
    let driver = driver_with(voice_config(0.0, Some(silence)), Arc::new(TagEncoder::new(1)), 1, 1);

    let (audio, _) = driver.synthesize(&SynthesisRequest::new("a,b")).unwrap();
    // "a," -> bos pad a pad , pad eos; "b" -> bos pad b pad eos.
    let first = 7 * SAMPLES_PER_SLICE;
    let gap = (0.3 * SAMPLE_RATE as f32) as usize;
    let second = 5 * SAMPLES_PER_SLICE;
    assert_eq!(audio.len(), first + gap + second);
    assert!(audio[first..first + gap].iter().all(|&s| s == 0));
    assert_eq!(runs(&audio), tags("ab"));
}
