use geobox::acquisition::{AcquisitionWorker, CycleControl, DepthSensor};
use geobox::pipeline::{FrameCycle, FrameOutput, FramePipeline, FrameSink};
use geobox::{GeoboxError, Grid, RawDepthFrame, Result, SandboxConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WIDTH: usize = 24;
const HEIGHT: usize = 16;

/// Produces frames with a mound in the middle; every `fail_every`-th read fails.
struct ScriptedSensor {
    next_id: u64,
    fail_every: Option<u64>,
    silent_after: Option<u64>,
}

impl ScriptedSensor {
    fn new() -> Self {
        Self {
            next_id: 0,
            fail_every: None,
            silent_after: None,
        }
    }
}

impl DepthSensor for ScriptedSensor {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawDepthFrame> {
        std::thread::sleep(Duration::from_millis(3));
        if self.silent_after.is_some_and(|n| self.next_id >= n) {
            return Err(GeoboxError::SensorRead("sensor stopped answering".into()));
        }
        self.next_id += 1;
        if self.fail_every.is_some_and(|n| self.next_id % n == 0) {
            return Err(GeoboxError::SensorRead("usb hiccup".into()));
        }
        let mut depth = Grid::new(WIDTH, HEIGHT, 1000u16);
        for y in 5..11 {
            for x in 8..16 {
                depth.set(x, y, 700);
            }
        }
        depth.set(1, 1, 0);
        Ok(RawDepthFrame::new(self.next_id, depth))
    }

    fn resolution(&self) -> (usize, usize) {
        (WIDTH, HEIGHT)
    }
}

struct UnpluggedSensor;

impl DepthSensor for UnpluggedSensor {
    fn open(&mut self) -> Result<()> {
        Err(GeoboxError::SensorInit("device not found".into()))
    }

    fn read_frame(&mut self) -> Result<RawDepthFrame> {
        Err(GeoboxError::SensorRead("not open".into()))
    }

    fn resolution(&self) -> (usize, usize) {
        (WIDTH, HEIGHT)
    }
}

#[derive(Clone, Default)]
struct CollectingSink {
    outputs: Arc<Mutex<Vec<FrameOutput>>>,
    fail_first: bool,
}

impl FrameSink for CollectingSink {
    fn present(&mut self, output: &FrameOutput) -> Result<()> {
        if self.fail_first {
            self.fail_first = false;
            return Err(GeoboxError::InvalidConfig("renderer not ready".into()));
        }
        self.outputs.lock().unwrap().push(output.clone());
        Ok(())
    }
}

fn config() -> SandboxConfig {
    SandboxConfig {
        sensor_width: WIDTH,
        sensor_height: HEIGHT,
        physics_scale: 0.5,
        rain_enabled: true,
        rain_seed: Some(11),
        contour_interval: Some(0.2),
        acquisition_timeout_ms: 400,
        frame_budget_ms: 10,
        ..SandboxConfig::default()
    }
}

#[test]
fn cycle_presents_processed_frames() {
    let control = CycleControl::new();
    let sensor = ScriptedSensor {
        fail_every: Some(4),
        ..ScriptedSensor::new()
    };
    let (worker, latest) = AcquisitionWorker::spawn(sensor, &control, Duration::from_millis(2)).unwrap();
    let sink = CollectingSink::default();
    let outputs = sink.outputs.clone();

    let pipeline = FramePipeline::new(config()).unwrap();
    let mut cycle = FrameCycle::new(pipeline, sink, latest, control.clone()).with_frame_limit(12);
    let summary = cycle.run().unwrap();
    control.stop();
    worker.join();

    assert_eq!(summary.presented, 12);
    assert_eq!(summary.contained_errors, 0);
    let outputs = outputs.lock().unwrap();
    assert_eq!(outputs.len(), 12);

    let mut last_id = 0;
    for output in outputs.iter() {
        assert!(output.frame_id >= last_id);
        assert_ne!(output.frame_id % 4, 0);
        last_id = output.frame_id;

        assert_eq!(output.height.shape(), (WIDTH, HEIGHT));
        assert_eq!(output.water.shape(), (WIDTH, HEIGHT));
        assert!(output.height.data().iter().all(|h| (0.0..=1.0).contains(h)));
        assert!(output.water.data().iter().all(|w| *w >= 0.0));
        assert!(output.contour.is_some());
    }
    let mound = outputs[11].height.get(12, 8);
    let floor = outputs[11].height.get(2, 2);
    assert!(mound > floor);
}

#[test]
fn sink_errors_are_contained() {
    let control = CycleControl::new();
    let (worker, latest) =
        AcquisitionWorker::spawn(ScriptedSensor::new(), &control, Duration::from_millis(2)).unwrap();
    let sink = CollectingSink {
        fail_first: true,
        ..CollectingSink::default()
    };

    let pipeline = FramePipeline::new(config()).unwrap();
    let mut cycle = FrameCycle::new(pipeline, sink, latest, control.clone()).with_frame_limit(3);
    let summary = cycle.run().unwrap();
    control.stop();
    worker.join();

    assert_eq!(summary.contained_errors, 1);
    assert_eq!(summary.presented, 3);
}

#[test]
fn silent_sensor_times_out() {
    let control = CycleControl::new();
    let sensor = ScriptedSensor {
        silent_after: Some(2),
        ..ScriptedSensor::new()
    };
    let (worker, latest) = AcquisitionWorker::spawn(sensor, &control, Duration::from_millis(5)).unwrap();
    let sink = CollectingSink::default();
    let outputs = sink.outputs.clone();

    let pipeline = FramePipeline::new(config()).unwrap();
    let mut cycle = FrameCycle::new(pipeline, sink, latest, control.clone());
    let err = cycle.run().unwrap_err();
    control.stop();
    worker.join();

    assert!(matches!(err, GeoboxError::AcquisitionTimeout(_)));
    assert!(err.is_fatal());
    // The last good frame kept being reused while the sensor was silent.
    let outputs = outputs.lock().unwrap();
    assert!(outputs.iter().any(|o| o.stale));
    assert!(outputs.iter().all(|o| o.frame_id <= 2));
}

#[test]
fn sensor_init_failure_is_fatal() {
    let control = CycleControl::new();
    let err = AcquisitionWorker::spawn(UnpluggedSensor, &control, Duration::from_millis(5))
        .err()
        .unwrap();
    assert!(matches!(err, GeoboxError::SensorInit(_)));
}

#[test]
fn control_stops_a_running_cycle() {
    let control = CycleControl::new();
    let (worker, latest) =
        AcquisitionWorker::spawn(ScriptedSensor::new(), &control, Duration::from_millis(2)).unwrap();
    let pipeline = FramePipeline::new(config()).unwrap();
    let mut cycle = FrameCycle::new(pipeline, CollectingSink::default(), latest, control.clone());

    let stopper = control.clone();
    let timer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        stopper.stop();
    });
    let summary = cycle.run().unwrap();
    timer.join().unwrap();
    worker.join();

    assert!(summary.presented > 0);
    assert!(!control.is_running());
}
