mod common;

use std::time::Duration;

use crossfader::{
    error::ErrorKind,
    events::Event,
    settings::AudioSettingsUpdate,
    track::Track,
};

use common::{count, sleep, Harness, A, B, C};

fn track(url: &str) -> Track {
    Track::new(url.rsplit('/').next().unwrap_or(url), url).unwrap()
}

fn assert_equal_power((primary, secondary): (f32, f32), volume: f32) {
    let power = primary.powi(2) + secondary.powi(2);
    assert!(
        (power - volume.powi(2)).abs() < 1e-3,
        "{primary}² + {secondary}² = {power}, expected {}",
        volume.powi(2)
    );
}

#[tokio::test(start_paused = true)]
async fn crossfade_triggers_once_near_the_end() {
    let mut harness = Harness::new();
    harness.engine.update_settings(&AudioSettingsUpdate {
        crossfade_duration: Some(Duration::from_secs(4)),
        ..Default::default()
    });
    harness.play(A, 30.0).await;

    harness.engine.seek(Duration::from_millis(26_600)).unwrap();
    sleep(350).await;
    assert_eq!(count(&harness.drain(), &Event::CrossfadeStart), 1);
    assert!(harness.engine.crossfade_state().triggered);

    sleep(1_000).await;
    assert_eq!(count(&harness.drain(), &Event::CrossfadeStart), 0);

    // Seeking back rearms the trigger.
    harness.engine.seek(Duration::from_secs(5)).unwrap();
    assert!(!harness.engine.crossfade_state().triggered);
    harness.engine.seek(Duration::from_millis(26_600)).unwrap();
    sleep(150).await;
    assert_eq!(count(&harness.drain(), &Event::CrossfadeStart), 1);
}

#[tokio::test(start_paused = true)]
async fn nothing_triggers_too_close_to_the_end() {
    let mut harness = Harness::new();
    harness.engine.update_settings(&AudioSettingsUpdate {
        crossfade_duration: Some(Duration::from_secs(4)),
        ..Default::default()
    });
    harness.play(A, 30.0).await;

    harness.engine.seek(Duration::from_millis(29_700)).unwrap();
    sleep(350).await;
    assert_eq!(count(&harness.drain(), &Event::CrossfadeStart), 0);
}

#[tokio::test(start_paused = true)]
async fn gapless_triggers_without_crossfade() {
    let mut harness = Harness::new();
    harness.engine.update_settings(&AudioSettingsUpdate {
        crossfade_enabled: Some(false),
        ..Default::default()
    });
    harness.play(A, 10.0).await;

    harness.engine.seek(Duration::from_millis(9_000)).unwrap();
    sleep(150).await;
    assert_eq!(count(&harness.drain(), &Event::CrossfadeStart), 0);

    harness.engine.seek(Duration::from_millis(9_750)).unwrap();
    sleep(150).await;
    assert_eq!(count(&harness.drain(), &Event::CrossfadeStart), 1);
}

#[tokio::test(start_paused = true)]
async fn crossfade_hands_over_at_equal_power() {
    let mut harness = Harness::new();
    harness.play(A, 10.0).await;
    harness.engine.set_volume(0.8);
    harness.fetch.audio(B, 10.0, Duration::from_millis(100));

    harness.engine.crossfade_to(&track(B)).await.unwrap();
    assert!(harness.engine.is_crossfading());

    for _ in 0..4 {
        sleep(200).await;
        assert_equal_power(harness.engine.gains(), 0.8);
    }
    let (outgoing, incoming) = harness.engine.gains();
    assert!(incoming > outgoing);

    sleep(400).await;
    let events = harness.drain();
    assert_eq!(count(&events, &Event::TrackChanged), 1);
    assert!(!harness.engine.is_crossfading());

    let state = harness.engine.state();
    assert_eq!(state.src.as_ref().map(url::Url::as_str), Some(B));
    assert_eq!(harness.engine.gains(), (0.8, 0.0));

    let former = harness.engine.secondary();
    assert!(former.is_paused());
    assert_eq!(former.current_time(), Duration::ZERO);
    assert_eq!(harness.registry.binding_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn both_tracks_are_audible_mid_fade() {
    let mut harness = Harness::new();
    harness.play(A, 10.0).await;
    harness.fetch.audio(B, 10.0, Duration::ZERO);

    harness.engine.crossfade_to(&track(B)).await.unwrap();
    sleep(500).await;

    let outputs = harness.render(Duration::from_millis(100));
    assert_eq!(outputs.len(), 2);
    assert!(outputs.iter().all(|output| common::peak(output) > 0.1));
}

#[tokio::test(start_paused = true)]
async fn volume_during_fade_applies_after_it() {
    let mut harness = Harness::new();
    harness.play(A, 10.0).await;
    harness.fetch.audio(B, 10.0, Duration::ZERO);

    harness.engine.crossfade_to(&track(B)).await.unwrap();
    sleep(300).await;
    assert!(!harness.engine.set_volume(0.5));
    assert_equal_power(harness.engine.gains(), 1.0);

    sleep(1_000).await;
    assert_eq!(harness.engine.gains(), (0.5, 0.0));
    assert_eq!(harness.engine.volume(), 0.5);
}

#[tokio::test(start_paused = true)]
async fn cancelled_fade_leaves_one_path() {
    let mut harness = Harness::new();
    harness.play(A, 10.0).await;
    harness.engine.set_volume(0.7);
    harness.fetch.audio(B, 10.0, Duration::ZERO);

    harness.engine.crossfade_to(&track(B)).await.unwrap();
    sleep(300).await;
    assert!(harness.engine.cancel_crossfade());
    assert!(!harness.engine.cancel_crossfade());

    assert_eq!(harness.engine.gains(), (0.7, 0.0));
    assert!(!harness.engine.has_fade_task());
    assert!(harness.engine.secondary().is_paused());

    sleep(2_000).await;
    assert_eq!(harness.engine.gains(), (0.7, 0.0));
    assert_eq!(count(&harness.drain(), &Event::TrackChanged), 0);
    assert_eq!(
        harness.engine.state().src.as_ref().map(url::Url::as_str),
        Some(A)
    );
    assert!(!harness.engine.is_crossfading());
}

#[tokio::test(start_paused = true)]
async fn pausing_cancels_the_fade() {
    let mut harness = Harness::new();
    harness.play(A, 10.0).await;
    harness.fetch.audio(B, 10.0, Duration::ZERO);

    harness.engine.crossfade_to(&track(B)).await.unwrap();
    sleep(300).await;
    harness.engine.pause();

    assert!(!harness.engine.is_crossfading());
    assert!(!harness.engine.is_playing());
    assert!(harness.engine.secondary().is_paused());
    assert_eq!(harness.engine.gains(), (1.0, 0.0));
}

#[tokio::test(start_paused = true)]
async fn outgoing_track_ends_quietly_mid_fade() {
    let mut harness = Harness::new();
    harness.play(A, 1.5).await;
    harness.engine.seek(Duration::from_millis(700)).unwrap();
    harness.fetch.audio(B, 10.0, Duration::ZERO);

    harness.engine.crossfade_to(&track(B)).await.unwrap();
    // A runs out 800 ms into the one second ramp.
    harness.render(Duration::from_millis(900));
    sleep(300).await;
    assert!(harness.engine.is_crossfading());
    assert_eq!(count(&harness.drain(), &Event::Ended), 0);

    sleep(1_000).await;
    let events = harness.drain();
    assert_eq!(count(&events, &Event::Ended), 0);
    assert_eq!(count(&events, &Event::TrackChanged), 1);
    assert!(harness.engine.is_playing());
    assert_eq!(
        harness.engine.state().src.as_ref().map(url::Url::as_str),
        Some(B)
    );
}

#[tokio::test(start_paused = true)]
async fn cancelled_fade_reports_the_end_it_held_back() {
    let mut harness = Harness::new();
    harness.play(A, 1.5).await;
    harness.engine.seek(Duration::from_millis(700)).unwrap();
    harness.fetch.audio(B, 10.0, Duration::ZERO);

    harness.engine.crossfade_to(&track(B)).await.unwrap();
    harness.render(Duration::from_millis(900));
    sleep(300).await;
    assert!(harness.engine.cancel_crossfade());

    sleep(200).await;
    let events = harness.drain();
    assert_eq!(count(&events, &Event::Ended), 1);
    assert_eq!(count(&events, &Event::TrackChanged), 0);
}

#[tokio::test(start_paused = true)]
async fn loading_the_target_while_preparing_loads_it() {
    let harness = Harness::new();
    harness.fetch.audio(A, 10.0, Duration::ZERO);
    assert!(harness.engine.load(A, false).await.is_loaded());
    harness.engine.play().unwrap();
    harness.fetch.audio(B, 10.0, Duration::from_millis(500));

    let track_b = track(B);
    let (fade, load) = tokio::join!(harness.engine.crossfade_to(&track_b), async {
        sleep(100).await;
        harness.engine.load(B, false).await
    });
    assert_eq!(fade.unwrap_err().kind, ErrorKind::Aborted);
    assert!(load.is_loaded());
    assert!(!harness.engine.is_crossfading());
    assert_eq!(
        harness.engine.state().src.as_ref().map(url::Url::as_str),
        Some(B)
    );
}

#[tokio::test(start_paused = true)]
async fn unreachable_track_fails_the_fade() {
    let mut harness = Harness::new();
    harness.play(A, 10.0).await;
    harness.fetch.gone(B);

    let error = harness.engine.crossfade_to(&track(B)).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::FadeFailure);
    assert!(!harness.engine.is_crossfading());
    assert_eq!(harness.engine.gains().0, 1.0);
    assert!(harness.engine.is_playing());
}

#[tokio::test(start_paused = true)]
async fn slow_track_times_out() {
    let mut harness = Harness::new();
    harness.play(A, 10.0).await;
    harness.fetch.audio(B, 10.0, Duration::from_secs(5));

    let error = harness.engine.crossfade_to(&track(B)).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::FadeFailure);
    assert!(!harness.engine.is_crossfading());
    assert_eq!(harness.engine.gains(), (1.0, 0.0));
}

#[tokio::test(start_paused = true)]
async fn newer_fade_supersedes_older() {
    let mut harness = Harness::new();
    harness.play(A, 10.0).await;
    harness.fetch.audio(B, 10.0, Duration::from_millis(500));
    harness.fetch.audio(C, 10.0, Duration::from_millis(100));

    let track_b = track(B);
    let (b, c) = tokio::join!(harness.engine.crossfade_to(&track_b), async {
        sleep(10).await;
        harness.engine.crossfade_to(&track(C)).await
    });
    assert_eq!(b.unwrap_err().kind, ErrorKind::Aborted);
    c.unwrap();

    sleep(1_500).await;
    assert_eq!(count(&harness.drain(), &Event::TrackChanged), 1);
    assert_eq!(
        harness.engine.state().src.as_ref().map(url::Url::as_str),
        Some(C)
    );
}

#[tokio::test(start_paused = true)]
async fn loading_during_a_fade_completes_it() {
    let mut harness = Harness::new();
    harness.play(A, 10.0).await;
    harness.fetch.audio(B, 10.0, Duration::ZERO);

    harness.engine.crossfade_to(&track(B)).await.unwrap();
    sleep(300).await;

    assert!(matches!(
        harness.engine.load(B, false).await,
        crossfader::element::LoadResult::Skipped
    ));
    assert!(!harness.engine.is_crossfading());
    assert_eq!(harness.engine.gains(), (1.0, 0.0));
    assert_eq!(count(&harness.drain(), &Event::TrackChanged), 1);
    assert_eq!(harness.fetch.count(B), 1);
}

#[tokio::test(start_paused = true)]
async fn preloaded_track_is_not_fetched_again() {
    let mut harness = Harness::new();
    harness.play(A, 10.0).await;
    harness.fetch.audio(B, 10.0, Duration::from_millis(100));

    harness.engine.preload_next(B).await;
    harness.engine.preload_next(B).await;
    assert_eq!(harness.fetch.count(B), 1);

    harness.engine.crossfade_to(&track(B)).await.unwrap();
    sleep(1_200).await;
    assert_eq!(count(&harness.drain(), &Event::TrackChanged), 1);
    assert_eq!(harness.fetch.count(B), 1);
}

#[tokio::test(start_paused = true)]
async fn elements_swap_back_and_forth() {
    let mut harness = Harness::new();
    harness.play(A, 10.0).await;
    let first = harness.engine.primary();
    harness.fetch.audio(B, 10.0, Duration::ZERO);
    harness.fetch.audio(C, 10.0, Duration::ZERO);

    harness.engine.crossfade_to(&track(B)).await.unwrap();
    sleep(1_200).await;
    assert!(harness.engine.secondary().ptr_eq(&first));

    harness.engine.crossfade_to(&track(C)).await.unwrap();
    sleep(1_200).await;
    assert!(harness.engine.primary().ptr_eq(&first));
    assert_eq!(count(&harness.drain(), &Event::TrackChanged), 2);
    assert_eq!(harness.registry.binding_count(), 2);
}
