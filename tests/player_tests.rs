//! End-to-end playback scenarios against a manually-driven device
//!
//! The test thread stands in for the device's realtime context: each
//! `drive` call is one render period. The decoder worker and collector run
//! on their real threads, so these tests exercise the full producer and
//! consumer coupling.

mod helpers;

use gapless_player::audio::device::{OutputDevice, RenderOutcome};
use gapless_player::{EngineConfig, Error, PcmFormat, Player};
use helpers::{init_tracing, sample_at, wait_until, EventLog, ManualDevice, ScriptedDecoder};
use std::sync::Arc;
use std::time::Duration;

const RENDER_FRAMES: usize = 512;
const TIMEOUT: Duration = Duration::from_secs(5);

fn mono_48k() -> PcmFormat {
    PcmFormat::planar_f32(48000, 1)
}

fn new_player(device_format: PcmFormat) -> (Player, Arc<ManualDevice>) {
    init_tracing();
    let device = ManualDevice::new(device_format, RENDER_FRAMES);
    let player = Player::new(EngineConfig::default(), Arc::clone(&device) as _)
        .expect("player construction");
    (player, device)
}

/// Drive render passes until the engine stops itself or `limit` passes ran
fn drive_to_stop(device: &ManualDevice, limit: usize) {
    for _ in 0..limit {
        let (outcome, _) = device.drive(RENDER_FRAMES);
        if outcome == RenderOutcome::StopOutput {
            return;
        }
        if outcome == RenderOutcome::Silence {
            // Let the worker catch up.
            std::thread::sleep(Duration::from_millis(2));
        }
    }
    panic!("engine did not stop within {limit} render passes");
}

#[test]
fn test_single_decoder_plays_to_completion() {
    let log = EventLog::new();
    let (player, device) = new_player(PcmFormat::interleaved_f32(48000, 1));

    player
        .enqueue(ScriptedDecoder::new("a", mono_48k(), 48000, Arc::clone(&log)))
        .expect("enqueue");
    player.play().expect("play");

    // The worker activates the decoder and reports its total.
    assert!(wait_until(TIMEOUT, || player.total_frames() == Some(48000)));
    assert_eq!(player.playing_url().as_deref(), Some("a"));

    let mut max_time: f64 = 0.0;
    for _ in 0..4096 {
        if let Some(time) = player.current_time() {
            max_time = max_time.max(time);
        }
        let (outcome, _) = device.drive(RENDER_FRAMES);
        match outcome {
            RenderOutcome::StopOutput => break,
            // Pace the passes like a real render period so the worker's
            // end-of-stream read lands before the final attribution.
            RenderOutcome::Silence => std::thread::sleep(Duration::from_millis(2)),
            RenderOutcome::Rendered(_) => std::thread::sleep(Duration::from_millis(1)),
        }
    }

    // Playback ran to the end of the stream and stopped on its own.
    assert!(!player.is_playing());
    assert!(max_time > 0.9, "playhead only reached {max_time:.3}s");

    assert_eq!(log.count("a:decoding_started"), 1);
    assert_eq!(log.count("a:decoding_finished"), 1);
    assert_eq!(log.count("a:rendering_started"), 1);
    assert_eq!(log.count("a:rendering_finished"), 1);

    // Lifecycle order: decode bracket opens before the render bracket
    // closes around it.
    assert!(log.position("a:decoding_started").unwrap() < log.position("a:rendering_started").unwrap());
    assert!(log.position("a:decoding_finished").unwrap() < log.position("a:rendering_finished").unwrap());
}

#[test]
fn test_gapless_join_is_bit_exact() {
    let log = EventLog::new();
    let (player, device) = new_player(PcmFormat::interleaved_f32(48000, 1));

    player
        .enqueue(ScriptedDecoder::new("a", mono_48k(), 24000, Arc::clone(&log)))
        .expect("enqueue a");
    player
        .enqueue(ScriptedDecoder::new("b", mono_48k(), 24000, Arc::clone(&log)))
        .expect("enqueue b");
    player.play().expect("play");

    // Pull exactly the 48000 frames both decoders contribute, waiting for
    // the worker before each pass so the converter never pads silence.
    let mut rendered: Vec<f32> = Vec::with_capacity(48000);
    while rendered.len() < 48000 {
        let want = (48000 - rendered.len()).min(RENDER_FRAMES);
        assert!(
            wait_until(TIMEOUT, || player.buffered_frames() >= want),
            "worker starved at frame {}",
            rendered.len()
        );
        let (outcome, buffer) = device.drive(want);
        assert_eq!(outcome, RenderOutcome::Rendered(want));
        rendered.extend_from_slice(&buffer);
    }

    // Bit-exact concatenation of a then b, no gap in between.
    for (i, &sample) in rendered.iter().enumerate() {
        let expected = sample_at((i % 24000) as i64);
        assert!(
            sample == expected,
            "frame {i}: got {sample}, expected {expected}"
        );
    }

    drive_to_stop(&device, 64);

    // One lifecycle per decoder, in enqueue order.
    for name in ["a", "b"] {
        assert_eq!(log.count(&format!("{name}:decoding_started")), 1);
        assert_eq!(log.count(&format!("{name}:rendering_started")), 1);
        assert_eq!(log.count(&format!("{name}:rendering_finished")), 1);
    }
    assert!(log.position("a:decoding_started").unwrap() < log.position("b:decoding_started").unwrap());
    assert!(log.position("a:rendering_started").unwrap() < log.position("b:rendering_started").unwrap());
}

#[test]
fn test_mismatched_format_is_rejected() {
    let log = EventLog::new();
    let (player, device) = new_player(PcmFormat::interleaved_f32(48000, 1));

    player
        .enqueue(ScriptedDecoder::new("a", mono_48k(), 24000, Arc::clone(&log)))
        .expect("enqueue a");
    player.play().expect("play");
    assert!(wait_until(TIMEOUT, || player.playing_url().is_some()));

    let queued_before = player.queue_len();
    let mismatched = ScriptedDecoder::new(
        "b",
        PcmFormat::planar_f32(44100, 1),
        24000,
        Arc::clone(&log),
    );
    let rejection = player.enqueue(mismatched).expect_err("format must mismatch");

    // The caller keeps the decoder and the queue is untouched.
    assert_eq!(rejection.decoder.url(), "b");
    assert!(matches!(rejection.error, Error::FormatMismatch { .. }));
    assert_eq!(player.queue_len(), queued_before);

    // The first decoder still plays to completion.
    drive_to_stop(&device, 4096);
    assert_eq!(log.count("a:rendering_finished"), 1);
    assert_eq!(log.count("b:decoding_started"), 0);
}

#[test]
fn test_seek_to_end_finishes_within_a_period() {
    let log = EventLog::new();
    let (player, device) = new_player(PcmFormat::interleaved_f32(48000, 1));

    // Ten seconds at 48 kHz.
    player
        .enqueue(ScriptedDecoder::new("a", mono_48k(), 480_000, Arc::clone(&log)))
        .expect("enqueue");
    player.play().expect("play");

    // Render a little so the stream is audibly underway.
    assert!(wait_until(TIMEOUT, || player.buffered_frames() >= RENDER_FRAMES));
    let (outcome, _) = device.drive(RENDER_FRAMES);
    assert_eq!(outcome, RenderOutcome::Rendered(RENDER_FRAMES));
    assert!(log.contains("a:rendering_started"));

    assert!(player.seek_to_frame(480_000));

    // The worker lands on the final frame and decodes the tail.
    assert!(wait_until(TIMEOUT, || {
        player.current_frame().map_or(true, |frame| frame >= 479_999)
    }));

    drive_to_stop(&device, 4096);

    assert_eq!(log.count("a:rendering_finished"), 1);
    assert_eq!(player.queue_len(), 0);
    assert!(player.playing_url().is_none());
}

#[test]
fn test_seek_requires_decoder_support() {
    let log = EventLog::new();
    let (player, device) = new_player(PcmFormat::interleaved_f32(48000, 1));

    player
        .enqueue(ScriptedDecoder::new("a", mono_48k(), 48000, Arc::clone(&log)).unseekable())
        .expect("enqueue");
    player.play().expect("play");
    assert!(wait_until(TIMEOUT, || player.playing_url().is_some()));
    assert!(!player.supports_seeking());

    let buffered = player.buffered_frames();
    assert!(!player.seek_to_frame(0));

    // Nothing moved: the request was refused before touching any counter.
    assert!(player.buffered_frames() >= buffered);
    assert!(wait_until(TIMEOUT, || player.buffered_frames() >= RENDER_FRAMES));
    let (outcome, _) = device.drive(RENDER_FRAMES);
    assert_eq!(outcome, RenderOutcome::Rendered(RENDER_FRAMES));
}

#[test]
fn test_no_current_decoder_refuses_seek() {
    let (player, _device) = new_player(PcmFormat::interleaved_f32(48000, 1));
    assert!(!player.seek_to_frame(100));
    assert!(!player.seek_by(1.0));
    assert!(player.current_frame().is_none());
    assert!(player.current_time().is_none());
}

#[test]
fn test_pause_play_keeps_position() {
    let log = EventLog::new();
    let (player, device) = new_player(PcmFormat::interleaved_f32(48000, 1));

    player
        .enqueue(ScriptedDecoder::new("a", mono_48k(), 48000, Arc::clone(&log)))
        .expect("enqueue");
    player.play().expect("play");

    assert!(wait_until(TIMEOUT, || player.buffered_frames() >= RENDER_FRAMES));
    device.drive(RENDER_FRAMES);
    device.drive(RENDER_FRAMES);

    player.pause().expect("pause");
    assert!(!player.is_playing());
    assert!(!device.is_running());

    let position = player.current_frame();
    player.play().expect("resume");
    assert_eq!(player.current_frame(), position);
}

#[test]
fn test_stop_then_enqueue_restarts_from_zero() {
    let log = EventLog::new();
    let (player, device) = new_player(PcmFormat::interleaved_f32(48000, 1));

    player
        .enqueue(ScriptedDecoder::new("a", mono_48k(), 480_000, Arc::clone(&log)))
        .expect("enqueue a");
    player.play().expect("play");
    assert!(wait_until(TIMEOUT, || player.buffered_frames() >= RENDER_FRAMES));
    device.drive(RENDER_FRAMES);

    player.stop().expect("stop");
    assert!(!player.is_playing());

    // Let the worker observe the cancellation and the collector reap.
    assert!(wait_until(TIMEOUT, || player.playing_url().is_none()));
    std::thread::sleep(Duration::from_millis(50));

    player
        .enqueue(ScriptedDecoder::new("b", mono_48k(), 48000, Arc::clone(&log)))
        .expect("enqueue b");
    assert!(wait_until(TIMEOUT, || {
        player.playing_url().as_deref() == Some("b")
    }));

    // The new decoder starts at frame zero of a fresh address space.
    assert_eq!(player.current_frame(), Some(0));

    player.play().expect("play b");
    assert!(wait_until(TIMEOUT, || player.buffered_frames() >= RENDER_FRAMES));
    let (outcome, buffer) = device.drive(RENDER_FRAMES);
    assert_eq!(outcome, RenderOutcome::Rendered(RENDER_FRAMES));
    assert_eq!(buffer[0], sample_at(0));
    assert_eq!(buffer[100], sample_at(100));
}

#[test]
fn test_virtual_format_change_rebuilds_and_resumes() {
    let log = EventLog::new();
    let (player, device) = new_player(PcmFormat::interleaved_f32(48000, 1));

    player
        .enqueue(ScriptedDecoder::new("a", mono_48k(), 96000, Arc::clone(&log)))
        .expect("enqueue");
    player.play().expect("play");

    assert!(wait_until(TIMEOUT, || player.buffered_frames() >= RENDER_FRAMES));
    device.drive(RENDER_FRAMES);
    assert_eq!(log.count("a:rendering_started"), 1);

    // The platform reconfigures the stream under us; the handler stops
    // output, rebuilds the converter, and restarts because we were playing.
    device.change_virtual_format(PcmFormat::interleaved_f32(44100, 1));
    assert!(player.is_playing());
    assert!(device.is_running());

    // Rendering resumes through the resampling converter.
    assert!(wait_until(TIMEOUT, || {
        let (outcome, _) = device.drive(RENDER_FRAMES);
        matches!(outcome, RenderOutcome::Rendered(_))
    }));

    // No duplicated lifecycle callbacks from the transition.
    assert_eq!(log.count("a:decoding_started"), 1);
    assert_eq!(log.count("a:rendering_started"), 1);
}

#[test]
fn test_hog_mode_roundtrip() {
    let log = EventLog::new();
    let (player, _device) = new_player(PcmFormat::interleaved_f32(48000, 1));

    assert!(!player.device_is_hogged().unwrap());

    player
        .enqueue(ScriptedDecoder::new("a", mono_48k(), 48000, Arc::clone(&log)))
        .expect("enqueue");
    player.play().expect("play");

    player.hog_device().expect("hog");
    assert!(player.device_is_hogged().unwrap());
    // Acquisition pauses and restores IO around the property write.
    assert!(player.is_playing());

    player.release_hog().expect("release");
    assert!(!player.device_is_hogged().unwrap());
    assert!(player.is_playing());
}

#[test]
fn test_volume_passthrough() {
    let (player, _device) = new_player(PcmFormat::interleaved_f32(48000, 2));

    player.set_master_volume(0.5).expect("set volume");
    assert_eq!(player.master_volume().unwrap(), 0.5);
}

#[test]
fn test_clear_queue_leaves_active_decoder() {
    let log = EventLog::new();
    let (player, device) = new_player(PcmFormat::interleaved_f32(48000, 1));

    player
        .enqueue(ScriptedDecoder::new("a", mono_48k(), 48000, Arc::clone(&log)))
        .expect("enqueue a");
    assert!(wait_until(TIMEOUT, || player.playing_url().is_some()));

    player
        .enqueue(ScriptedDecoder::new("b", mono_48k(), 48000, Arc::clone(&log)))
        .expect("enqueue b");
    player.clear_queue();
    assert_eq!(player.queue_len(), 0);

    // The active decoder still plays out.
    player.play().expect("play");
    drive_to_stop(&device, 4096);
    assert_eq!(log.count("a:rendering_finished"), 1);
    assert_eq!(log.count("b:decoding_started"), 0);
}
