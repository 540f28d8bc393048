use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::wire::message::{FieldValue, Message};
use crate::wire::protocol::{
    VID_LIST_STRIDE, VID_NUM_ITEMS, VID_NUM_PARAMETERS, VID_PARAM_LIST_BASE, VID_PARAM_STRIDE,
    VID_ROW_DATA_BASE, VID_UUID_LIST_BASE,
};

/// Where a list lives inside a message: the count field, the field carrying
/// the per-item stride, and the id of the first item's first field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListLayout {
    pub count_field: u32,
    pub stride_field: u32,
    pub base: u32,
    /// Stride assumed when a peer omits the stride field.
    pub default_stride: u32,
}

pub const ROW_LIST: ListLayout = ListLayout {
    count_field: VID_NUM_ITEMS,
    stride_field: VID_LIST_STRIDE,
    base: VID_ROW_DATA_BASE,
    default_stride: 10,
};

pub const UUID_LIST: ListLayout = ListLayout {
    count_field: VID_NUM_ITEMS,
    stride_field: VID_LIST_STRIDE,
    base: VID_UUID_LIST_BASE,
    default_stride: 1,
};

pub const PARAMETER_LIST: ListLayout = ListLayout {
    count_field: VID_NUM_PARAMETERS,
    stride_field: VID_PARAM_STRIDE,
    base: VID_PARAM_LIST_BASE,
    default_stride: 2,
};

#[derive(Debug, PartialEq, Eq)]
pub struct ListOverflow {
    pub items: usize,
    pub stride: usize,
}

impl fmt::Display for ListOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} items with stride {} do not fit in the field id space",
            self.items, self.stride
        )
    }
}

impl std::error::Error for ListOverflow {}

/// A peer declared more list items than its message carries fields.
#[derive(Debug, PartialEq, Eq)]
pub struct ListCountMismatch {
    pub declared: u32,
    pub fields: usize,
}

impl fmt::Display for ListCountMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "list declares {} items but the message carries {} fields",
            self.declared, self.fields
        )
    }
}

impl std::error::Error for ListCountMismatch {}

/// Field values of one listed item, in wire order.
#[derive(Debug, Default)]
pub struct Record {
    values: Vec<FieldValue>,
}

impl Record {
    pub fn push(&mut self, value: impl Into<FieldValue>) -> &mut Self {
        self.values.push(value.into());
        self
    }
}

// Writes `items` at `layout.base`. The stride is the widest record produced
// by `fill`, so no record can spill into its neighbour.
pub fn write_list<'a, T: 'a>(
    message: &mut Message,
    layout: ListLayout,
    items: impl IntoIterator<Item = &'a T>,
    mut fill: impl FnMut(&T, &mut Record),
) -> Result<u32, ListOverflow> {
    let records: Vec<Record> = items
        .into_iter()
        .map(|item| {
            let mut record = Record::default();
            fill(item, &mut record);
            record
        })
        .collect();

    let stride = records
        .iter()
        .map(|record| record.values.len())
        .max()
        .unwrap_or(0)
        .max(1);
    let overflow = || ListOverflow {
        items: records.len(),
        stride,
    };
    let span = records
        .len()
        .checked_mul(stride)
        .and_then(|span| u32::try_from(span).ok())
        .ok_or_else(overflow)?;
    layout.base.checked_add(span).ok_or_else(overflow)?;
    let count = u32::try_from(records.len()).map_err(|_| overflow())?;
    let stride = stride as u32;

    message.set(layout.count_field, count);
    message.set(layout.stride_field, stride);
    for (index, record) in records.into_iter().enumerate() {
        let mut field_id = layout.base + index as u32 * stride;
        for value in record.values {
            message.set(field_id, value);
            field_id += 1;
        }
    }

    Ok(stride)
}

pub struct ListReader<'a> {
    message: &'a Message,
    layout: ListLayout,
    count: u32,
    stride: u32,
}

impl<'a> ListReader<'a> {
    // A missing count field reads as an empty list. Every item takes at least
    // one field, so the count never exceeds the fields actually present.
    pub fn new(message: &'a Message, layout: ListLayout) -> Self {
        let declared = message.get_u32(layout.count_field).unwrap_or(0);
        let present = u32::try_from(message.field_count()).unwrap_or(u32::MAX);
        let stride = message
            .get_u32(layout.stride_field)
            .filter(|stride| *stride > 0)
            .unwrap_or(layout.default_stride);
        Self {
            message,
            layout,
            count: declared.min(present),
            stride,
        }
    }

    /// Like `new`, but a declared count the message cannot back is an error
    /// instead of being clamped. Used for requests.
    pub fn checked(message: &'a Message, layout: ListLayout) -> Result<Self, ListCountMismatch> {
        let reader = Self::new(message, layout);
        match message.get_u32(layout.count_field) {
            Some(declared) if declared > reader.count => Err(ListCountMismatch {
                declared,
                fields: message.field_count(),
            }),
            _ => Ok(reader),
        }
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn records(&self) -> impl Iterator<Item = RecordReader<'a>> + '_ {
        (0..self.count).map_while(move |index| {
            let start = index
                .checked_mul(self.stride)
                .and_then(|offset| self.layout.base.checked_add(offset))?;
            Some(RecordReader {
                message: self.message,
                next_field: start,
                end_field: start.saturating_add(self.stride),
            })
        })
    }
}

/// Sequential cursor over the fields of one listed item.
pub struct RecordReader<'a> {
    message: &'a Message,
    next_field: u32,
    end_field: u32,
}

impl<'a> RecordReader<'a> {
    pub fn next_value(&mut self) -> Option<&'a FieldValue> {
        if self.next_field >= self.end_field {
            return None;
        }
        let value = self.message.get(self.next_field);
        self.next_field += 1;
        value
    }

    pub fn next_str(&mut self) -> Option<&'a str> {
        self.next_value().and_then(FieldValue::as_str)
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        self.next_value().and_then(FieldValue::as_u32)
    }

    pub fn next_i64(&mut self) -> Option<i64> {
        self.next_value().and_then(FieldValue::as_i64)
    }

    pub fn next_uuid(&mut self) -> Option<Uuid> {
        self.next_value().and_then(FieldValue::as_uuid)
    }

    pub fn next_timestamp(&mut self) -> Option<DateTime<Utc>> {
        self.next_value().and_then(FieldValue::as_timestamp)
    }
}
