//! Provide Object Detection
//!
pub mod onnx {
    use image::{imageops::FilterType, ImageBuffer, Pixel, Rgb};
    use ndarray::{s, Array, Axis, IxDyn};
    use ort::{
        environment::Environment, value::Value, ExecutionProvider, GraphOptimizationLevel,
        LoggingLevel, Session, SessionBuilder,
    };
    use std::path::Path;

    use super::{Detection, DefectClasses, Detector};
    use crate::module::define;

    /// Model input resolution.
    const IMGSZ: u32 = 640;

    /// Minimum confidence kept from the raw model output.
    const MIN_PROB: f32 = 0.5;

    /// YOLO session store for the combined defect model.
    pub struct YoloDefect {
        session: Session,
    }

    impl YoloDefect {
        /// Load the combined defect model from the asset directory.
        pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
            Ok(Self {
                session: Self::get_session("defect_640", define::path::DEFECT_640_MODEL)?,
            })
        }

        /// Build an inference session for a model file.
        pub fn get_session(
            name: &str,
            model_path: &str,
        ) -> Result<Session, Box<dyn std::error::Error>> {
            let environment = Environment::builder()
                .with_name(name)
                .with_log_level(LoggingLevel::Warning)
                .with_execution_providers([ExecutionProvider::CPU(Default::default())])
                .build()?
                .into_arc();
            let session = SessionBuilder::new(&environment)?
                .with_optimization_level(GraphOptimizationLevel::Level1)?
                .with_intra_threads(4)?
                .with_model_from_file(model_path)?;
            Ok(session)
        }

        /// Run inference on an image file.
        pub fn infer(&self, impath: &str) -> Result<Vec<Detection>, Box<dyn std::error::Error>> {
            // Load image and resize to model shape, converting to RGB format
            let img: ImageBuffer<Rgb<u8>, Vec<u8>> = image::open(Path::new(impath))?
                .resize_exact(IMGSZ, IMGSZ, FilterType::Nearest)
                .to_rgb8();

            let array = ndarray::CowArray::from(
                ndarray::Array::from_shape_fn(
                    (1, 3, IMGSZ as usize, IMGSZ as usize),
                    |(_, c, j, i)| {
                        let pixel = img.get_pixel(i as u32, j as u32);
                        let channels = pixel.channels();
                        // normalize
                        // range [0, 255] -> range [0, 1]
                        (channels[c] as f32) / 255.0
                    },
                )
                .into_dyn(),
            );

            let tensor = vec![Value::from_array(self.session.allocator(), &array)?];

            let outs = self.session.run(tensor)?;
            let out = outs
                .get(0)
                .ok_or("empty model output")?
                .try_extract::<f32>()?
                .view()
                .t()
                .into_owned();
            convert_yolo_fmt(out)
        }
    }

    impl Detector for YoloDefect {
        fn detect(&self, impath: &str) -> Result<Vec<Detection>, Box<dyn std::error::Error>> {
            self.infer(impath)
        }
    }

    fn convert_yolo_fmt(
        out: Array<f32, IxDyn>,
    ) -> Result<Vec<Detection>, Box<dyn std::error::Error>> {
        let mut bboxes = vec![];
        let output = out.slice(s![.., .., 0]);
        for row in output.axis_iter(Axis(0)) {
            let row: Vec<_> = row.iter().copied().collect();
            let (class_id, prob) = row
                .iter()
                .skip(4)
                .enumerate()
                .map(|(index, value)| (index, *value))
                .reduce(|accum, row| if row.1 > accum.1 { row } else { accum })
                .ok_or("malformed model output row")?;
            if prob < MIN_PROB {
                continue;
            }
            let cls = class_id as u32;
            let xc = row[0];
            let yc = row[1];
            let w = row[2] as u32;
            let h = row[3] as u32;
            let x1 = (xc - w as f32 / 2.0) as u32;
            let x2 = (xc + w as f32 / 2.0) as u32;
            let y1 = (yc - h as f32 / 2.0) as u32;
            let y2 = (yc + h as f32 / 2.0) as u32;
            let label = DefectClasses::from_u32(cls)
                .map(|c| c.label().to_string())
                .unwrap_or_default();
            bboxes.push(Detection {
                x1,
                y1,
                x2,
                y2,
                xc,
                yc,
                cls,
                prob,
                w,
                h,
                label,
            })
        }
        bboxes.sort_by(|box1, box2| box2.prob.total_cmp(&box1.prob));
        Ok(merge_bboxes(bboxes))
    }

    /// Function to compute the IoU of two rectangles.
    fn iou(r1: &Detection, r2: &Detection) -> f64 {
        let x1 = r1.x1.max(r2.x1) as f64;
        let y1 = r1.y1.max(r2.y1) as f64;
        let x2 = r1.x2.min(r2.x2) as f64;
        let y2 = r1.y2.min(r2.y2) as f64;
        let w = if x2 - x1 > 0.0 { x2 - x1 } else { 0.0 };
        let h = if y2 - y1 > 0.0 { y2 - y1 } else { 0.0 };
        let intersection = w * h;
        let area_r1 = ((r1.x2 - r1.x1 + 1) * (r1.y2 - r1.y1 + 1)) as f64;
        let area_r2 = ((r2.x2 - r2.x1 + 1) * (r2.y2 - r2.y1 + 1)) as f64;
        let union = area_r1 + area_r2 - intersection;
        intersection / union
    }

    /// Merges bounding boxes of the same class whose IoU is 0.7 or more.
    fn merge_bboxes(bboxes: Vec<Detection>) -> Vec<Detection> {
        let mut merged_bboxes = Vec::new();
        let mut used = vec![false; bboxes.len()];
        for i in 0..bboxes.len() {
            if used[i] {
                continue;
            }
            let mut merged_bbox = bboxes[i].clone();
            used[i] = true;
            for j in 0..bboxes.len() {
                if used[j] || bboxes[i].cls != bboxes[j].cls {
                    continue;
                }
                if iou(&bboxes[i], &bboxes[j]) >= 0.7 {
                    let x1 = merged_bbox.x1.min(bboxes[j].x1);
                    let y1 = merged_bbox.y1.min(bboxes[j].y1);
                    let x2 = merged_bbox.x2.max(bboxes[j].x2);
                    let y2 = merged_bbox.y2.max(bboxes[j].y2);
                    let w = x2 - x1;
                    let h = y2 - y1;
                    let xc = x1 as f32 + w as f32 / 2.0;
                    let yc = y1 as f32 + h as f32 / 2.0;

                    merged_bbox = Detection {
                        x1,
                        y1,
                        x2,
                        y2,
                        xc,
                        yc,
                        w,
                        h,
                        ..merged_bbox
                    };
                    used[j] = true;
                }
            }
            merged_bboxes.push(merged_bbox);
        }
        merged_bboxes
    }
}

/// Opaque detection seam.
///
/// The control loop and camera workers only depend on this trait, so the
/// model can be swapped (or faked in tests) without touching the core.
pub trait Detector: Send {
    fn detect(&self, impath: &str) -> Result<Vec<Detection>, Box<dyn std::error::Error>>;
}

/// Combined defect model's classes.
#[derive(Debug, Clone, PartialEq)]
pub enum DefectClasses {
    SoundKnots,
    UnsoundKnots,
}

impl DefectClasses {
    pub fn from_u32(i: u32) -> Option<DefectClasses> {
        match i {
            0 => Some(DefectClasses::SoundKnots),
            1 => Some(DefectClasses::UnsoundKnots),
            _ => None,
        }
    }
    pub fn to_u32(&self) -> u32 {
        match self {
            DefectClasses::SoundKnots => 0,
            DefectClasses::UnsoundKnots => 1,
        }
    }
    /// Model output label for the class.
    pub fn label(&self) -> &'static str {
        match self {
            DefectClasses::SoundKnots => "sound_knots",
            DefectClasses::UnsoundKnots => "unsound_knots",
        }
    }
}

/// Detection result
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
    pub xc: f32,
    pub yc: f32,
    pub cls: u32,
    pub prob: f32,
    pub w: u32,
    pub h: u32,
    pub label: String,
}

impl Default for Detection {
    fn default() -> Self {
        Self::new()
    }
}

impl Detection {
    pub fn new() -> Self {
        Self {
            x1: 0,
            y1: 0,
            x2: 0,
            y2: 0,
            xc: 0.0,
            yc: 0.0,
            cls: 0,
            prob: 0.0,
            w: 0,
            h: 0,
            label: String::new(),
        }
    }
}
