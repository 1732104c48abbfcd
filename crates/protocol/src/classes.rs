use thiserror::Error;

/// One entry of the class table: display label and overlay color (RGB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefectClass {
    pub label: &'static str,
    pub color: [u8; 3],
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("class id {class_id} is outside the class table (0..{len})")]
pub struct UnknownClass {
    pub class_id: i32,
    pub len: usize,
}

/// Fixed, ordered mapping from class id to label and color.
///
/// Producers (the backend) and consumers (gateway, compositor) index the same
/// table, so ids must never be remapped. Lookups outside the table fail rather
/// than wrap or fall back to a default.
#[derive(Debug, Clone, Copy)]
pub struct ClassColorTable {
    classes: &'static [DefectClass],
}

impl ClassColorTable {
    pub const fn new(classes: &'static [DefectClass]) -> Self {
        Self { classes }
    }

    pub fn get(&self, class_id: i32) -> Result<&DefectClass, UnknownClass> {
        usize::try_from(class_id)
            .ok()
            .and_then(|idx| self.classes.get(idx))
            .ok_or(UnknownClass {
                class_id,
                len: self.classes.len(),
            })
    }

    pub fn label(&self, class_id: i32) -> Result<&'static str, UnknownClass> {
        self.get(class_id).map(|c| c.label)
    }

    pub fn color(&self, class_id: i32) -> Result<[u8; 3], UnknownClass> {
        self.get(class_id).map(|c| c.color)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DefectClass> {
        self.classes.iter()
    }
}

/// Steel surface defect classes, in model output order.
pub static DEFECT_CLASSES: ClassColorTable = ClassColorTable::new(&[
    DefectClass {
        label: "edge_crack",
        color: [0, 0, 255],
    },
    DefectClass {
        label: "transverse_crack",
        color: [0, 255, 0],
    },
    DefectClass {
        label: "surface_inclusion",
        color: [255, 255, 0],
    },
    DefectClass {
        label: "patch_defect",
        color: [255, 0, 0],
    },
]);
