use serde::Serialize;

/// Single detection in pixel coordinates (`[x1, y1, x2, y2]`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: u32,
}

impl Detection {
    pub fn center(&self) -> (f32, f32) {
        (
            (self.bbox[0] + self.bbox[2]) / 2.0,
            (self.bbox[1] + self.bbox[3]) / 2.0,
        )
    }

    pub fn label(&self) -> &'static str {
        coco_label(self.class_id)
    }
}

/// Detections for a single frame.
#[derive(Debug, Clone, Default)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
}

/// Normalized planar frame handed to the inference engine.
///
/// Layout is CHW RGB, values scaled to `[0, 1]`.
pub struct Tensor {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

/// COCO class names, indexed by class id.
pub const COCO_CLASSES: &[&str] = &[
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// Map a class id to its COCO name, `"object"` when out of range.
pub fn coco_label(class_id: u32) -> &'static str {
    COCO_CLASSES.get(class_id as usize).copied().unwrap_or("object")
}

/// Look up the class id for a label, used to resolve `target_labels`.
pub fn coco_class_id(label: &str) -> Option<u32> {
    COCO_CLASSES
        .iter()
        .position(|name| *name == label)
        .map(|index| index as u32)
}
