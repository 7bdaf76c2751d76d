use std::time::{Duration, Instant};

use neuralca_core::{
    Brush, Device, Engine, EngineConfig, LayerParams, NcaError, Scheduler, ScriptedTicks, Stage,
    Throttle, VisMode, kernels::is_border, parse_model,
};

/// Layers whose weights and biases all quantise to (almost) zero.
fn quiet_layers(config: &EngineConfig) -> Vec<LayerParams> {
    config
        .layer_shapes()
        .iter()
        .map(|&(in_ch, out_ch)| {
            let len = 4 * (out_ch as usize / 4) * (in_ch as usize + 1);
            LayerParams::from_bytes(&vec![128; len], 1.0e-3, 1.0e-3, in_ch, out_ch)
        })
        .collect()
}

/// Layers whose second-layer bias pushes every channel up by roughly `bias`.
fn growing_layers(config: &EngineConfig, bias: f32) -> Vec<LayerParams> {
    let mut layers = quiet_layers(config);
    let (in_ch, out_ch) = config.layer_shapes()[1];
    let mut bytes = vec![128_u8; 4 * (out_ch as usize / 4) * (in_ch as usize + 1)];
    let bias_row = in_ch as usize * (out_ch as usize / 4) * 4;
    for b in &mut bytes[bias_row..] {
        *b = 255;
    }
    layers[1] = LayerParams::from_bytes(&bytes, 1.0e-3, bias * 2.0, in_ch, out_ch);
    layers
}

fn config(width: u32, height: u32) -> EngineConfig {
    EngineConfig {
        grid_width: width,
        grid_height: height,
        rng_seed: Some(0x5EED),
        benchmark_steps: 3,
        ..EngineConfig::default()
    }
}

#[test]
fn seeded_cell_survives_a_quiet_step() {
    let device = Device::new();
    let config = config(8, 8);
    let mut engine = Engine::new(&device, &quiet_layers(&config), config).expect("engine");
    engine.reset();
    engine.step();

    let state = engine.state();
    let alpha = state.read_channel(3, 3, 3);
    assert!(alpha > 0.9, "seed alpha {alpha}");
    let shape = *state.shape();
    for y in 0..8 {
        for x in 0..8 {
            if is_border(&shape, x, y) {
                for g in 0..shape.depth4 {
                    assert_eq!(state.read(x, y, g), [0.0; 4], "border ({x},{y})");
                }
            }
        }
    }
}

#[test]
fn growth_stays_inside_border() {
    let device = Device::new();
    let config = EngineConfig {
        update_probability: 1.0,
        ..config(10, 7)
    };
    let mut engine = Engine::new(&device, &growing_layers(&config, 0.5), config).expect("engine");
    for _ in 0..6 {
        engine.step();
    }
    let state = engine.state();
    let shape = *state.shape();
    let mut alive = 0;
    for y in 0..i64::from(shape.height) {
        for x in 0..i64::from(shape.width) {
            let alpha = state.read_channel(x, y, 3);
            if is_border(&shape, x, y) {
                assert_eq!(alpha, 0.0);
            } else if alpha >= 0.1 {
                alive += 1;
            }
        }
    }
    assert!(alive > 1, "positive bias should spread life beyond the seed");
}

#[test]
fn double_buffer_alternates_two_tensors() {
    let device = Device::new();
    let config = config(6, 6);
    let mut engine = Engine::new(&device, &quiet_layers(&config), config).expect("engine");
    let a = engine.state_id();
    let b = engine.next_state().id();
    let bytes = device.live_bytes();
    let mut seen = Vec::new();
    for _ in 0..4 {
        let written = engine.next_state().id();
        engine.step();
        assert_eq!(engine.state_id(), written);
        assert_ne!(engine.state_id(), engine.next_state().id());
        seen.push(engine.state_id());
    }
    assert_eq!(seen, vec![b, a, b, a]);
    assert_eq!(device.live_bytes(), bytes, "steps never reallocate");
}

#[test]
fn hot_swap_releases_old_weights() {
    let device = Device::new();
    let config = config(8, 8);
    let mut engine = Engine::new(&device, &quiet_layers(&config), config.clone()).expect("engine");
    let bytes = device.live_bytes();
    let textures = device.live_textures();

    engine
        .set_weights(&growing_layers(&config, 0.25))
        .expect("swap");
    assert_eq!(engine.weights().generation(), 1);
    assert_eq!(device.live_bytes(), bytes);
    assert_eq!(device.live_textures(), textures);

    let mut broken = quiet_layers(&config);
    broken[0].data_b64.truncate(8);
    let err = engine.set_weights(&broken).expect_err("malformed");
    assert!(matches!(err, NcaError::MalformedWeights { layer: 0, .. }));
    assert_eq!(engine.weights().generation(), 1);
    assert_eq!(device.live_bytes(), bytes);
    engine.step();
}

#[test]
fn engine_drop_releases_everything() {
    let device = Device::new();
    let config = config(16, 16);
    let engine = Engine::new(&device, &quiet_layers(&config), config).expect("engine");
    assert!(device.live_textures() >= 8);
    drop(engine);
    assert_eq!(device.live_bytes(), 0);
    assert_eq!(device.live_textures(), 0);
}

#[test]
fn paint_clear_wipes_a_region() {
    let device = Device::new();
    let config = config(12, 12);
    let mut engine = Engine::new(&device, &quiet_layers(&config), config).expect("engine");
    engine.paint(6.0, 6.0, 3.0, Brush::Seed);
    assert!(engine.state().read_channel(5, 5, 3) > 0.9);
    engine.paint(6.0, 6.0, 8.0, Brush::Clear);
    assert_eq!(engine.state().read_channel(5, 5, 3), 0.0);
    // Painting far off the grid touches nothing.
    engine.paint(-500.0, 900.0, 3.0, Brush::Seed);
    assert!(
        engine
            .state()
            .texels()
            .iter()
            .all(|t| *t == engine.state().pack().encode4([0.0; 4]))
    );
}

#[test]
fn benchmark_reports_every_stage() {
    let device = Device::new();
    let config = config(8, 8);
    let mut engine = Engine::new(&device, &quiet_layers(&config), config).expect("engine");
    let report = engine.benchmark();
    assert_eq!(report.stages.len(), Stage::PIPELINE.len());
    assert!(report.ms_per_step >= 0.0);
    let text = report.to_string();
    assert!(text.contains("ms/step"));
    assert!(text.contains("perception: "));
    assert!(text.contains("dropout: "));
    assert!(text.ends_with("\n\n"));
    assert_eq!(engine.steps(), 3);
}

#[test]
fn scheduler_batches_steps_under_throttle() {
    let device = Device::new();
    let config = config(8, 8);
    let mut engine = Engine::new(&device, &quiet_layers(&config), config).expect("engine");
    let t0 = Instant::now();
    let ticks = ScriptedTicks::new((0..4).map(|i| t0 + Duration::from_millis(i * 5)));
    let mut scheduler = Scheduler::new(
        ticks,
        Throttle::new(true, Duration::from_millis(18)),
        VisMode::Color,
    );
    let mut sizes = Vec::new();
    let summary = scheduler
        .run(&mut engine, |_, frame| {
            sizes.push((frame.width, frame.height));
            Ok::<(), std::convert::Infallible>(())
        })
        .expect("run");
    assert_eq!(summary.frames, 4);
    assert_eq!(summary.steps, 1 + 2 + 3 + 4);
    assert_eq!(summary.max_steps_per_frame, 4);
    assert_eq!(engine.steps(), 10);
    assert!(sizes.iter().all(|&s| s == (8, 8)));
}

#[test]
fn model_json_drives_engine() {
    let config = config(8, 8);
    let json = serde_json::to_string(&quiet_layers(&config)).expect("serialize");
    let layers = parse_model(&json).expect("parse");
    let device = Device::new();
    let mut engine = Engine::new(&device, &layers, config).expect("engine");
    engine.step();
    let frame = engine.draw(VisMode::Color);
    // The seed renders dark against the white background.
    assert!(frame.pixel(3, 3)[0] < 16);
    assert_eq!(frame.pixel(0, 0), [255, 255, 255, 255]);
}
