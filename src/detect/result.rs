use crate::metadata::{BoundingBox, ObjectClass};

/// One object reported by a detector backend, in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class: ObjectClass,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Label produced by a secondary classifier for one detected object.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}
