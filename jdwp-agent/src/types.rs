// JDWP type definitions
//
// Common types used across the agent: ids, locations, tagged values

use crate::protocol::{error_codes, JdwpError, JdwpResult};
use crate::reader::{read_u16, read_u32, read_u64, read_u8};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

// Object IDs are 8 bytes on the wire (see VirtualMachine.IDSizes)
pub type ObjectId = u64;
pub type ThreadId = ObjectId;

pub type ReferenceTypeId = u64;
pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;

pub const ID_SIZE: i32 = 8;

// Reference type tags
pub mod type_tags {
    pub const CLASS: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const ARRAY: u8 = 3;
}

// Location identifies a code position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub type_tag: u8, // 1=class, 2=interface, 3=array
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64, // bytecode index (PC)
}

impl Location {
    /// Placeholder used where JDWP expects a location but none exists
    /// (e.g. the catch location of an uncaught exception)
    pub fn none() -> Self {
        Self {
            type_tag: 0,
            class_id: 0,
            method_id: 0,
            index: 0,
        }
    }
}

/// A loaded class as the runtime reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRef {
    pub type_tag: u8,
    pub id: ReferenceTypeId,
    /// Binary name, e.g. `com.example.Main`
    pub name: String,
    /// JNI signature, e.g. `Lcom/example/Main;`
    pub signature: String,
    /// Source file name, e.g. `Main.java`, if the runtime knows it
    #[serde(default)]
    pub source_name: Option<String>,
}

impl ClassRef {
    pub fn new(id: ReferenceTypeId, name: &str) -> Self {
        Self {
            type_tag: type_tags::CLASS,
            id,
            name: name.to_string(),
            signature: format!("L{};", name.replace('.', "/")),
            source_name: None,
        }
    }

    pub fn with_source(mut self, source_name: &str) -> Self {
        self.source_name = Some(source_name.to_string());
        self
    }
}

// Thread status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ThreadStatus {
    Zombie = 0,
    Running = 1,
    Sleeping = 2,
    Monitor = 3,
    Wait = 4,
}

// Suspend status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum SuspendStatus {
    Running = 0,
    Suspended = 1,
}

// Type tags for values
pub mod tags {
    pub const ARRAY: u8 = b'[';
    pub const BYTE: u8 = b'B';
    pub const CHAR: u8 = b'C';
    pub const OBJECT: u8 = b'L';
    pub const FLOAT: u8 = b'F';
    pub const DOUBLE: u8 = b'D';
    pub const INT: u8 = b'I';
    pub const LONG: u8 = b'J';
    pub const SHORT: u8 = b'S';
    pub const VOID: u8 = b'V';
    pub const BOOLEAN: u8 = b'Z';
    pub const STRING: u8 = b's';
    pub const THREAD: u8 = b't';
    pub const THREAD_GROUP: u8 = b'g';
    pub const CLASS_LOADER: u8 = b'l';
    pub const CLASS_OBJECT: u8 = b'c';
}

// Tagged value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub tag: u8,
    pub data: ValueData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueData {
    Byte(i8),
    Char(u16),
    Float(f32),
    Double(f64),
    Int(i32),
    Long(i64),
    Short(i16),
    Boolean(bool),
    Object(ObjectId),
    Void,
}

impl Value {
    pub fn void() -> Self {
        Self {
            tag: tags::VOID,
            data: ValueData::Void,
        }
    }

    pub fn int(v: i32) -> Self {
        Self {
            tag: tags::INT,
            data: ValueData::Int(v),
        }
    }

    pub fn object(tag: u8, id: ObjectId) -> Self {
        Self {
            tag,
            data: ValueData::Object(id),
        }
    }

    /// Object id carried by this value, if it is a non-null reference
    pub fn object_id(&self) -> Option<ObjectId> {
        match self.data {
            ValueData::Object(id) if id != 0 => Some(id),
            _ => None,
        }
    }

    /// Read a tagged value (tag byte followed by the untagged value)
    pub fn read_tagged(buf: &mut &[u8]) -> JdwpResult<Self> {
        let tag = read_u8(buf)?;
        let data = match tag {
            tags::BYTE => ValueData::Byte(read_u8(buf)? as i8),
            tags::BOOLEAN => ValueData::Boolean(read_u8(buf)? != 0),
            tags::CHAR => ValueData::Char(read_u16(buf)?),
            tags::SHORT => ValueData::Short(read_u16(buf)? as i16),
            tags::INT => ValueData::Int(read_u32(buf)? as i32),
            tags::FLOAT => ValueData::Float(f32::from_bits(read_u32(buf)?)),
            tags::LONG => ValueData::Long(read_u64(buf)? as i64),
            tags::DOUBLE => ValueData::Double(f64::from_bits(read_u64(buf)?)),
            tags::VOID => ValueData::Void,
            tags::ARRAY
            | tags::OBJECT
            | tags::STRING
            | tags::THREAD
            | tags::THREAD_GROUP
            | tags::CLASS_LOADER
            | tags::CLASS_OBJECT => ValueData::Object(read_u64(buf)?),
            other => {
                return Err(JdwpError::Protocol(format!("Invalid value tag: {:#x}", other)));
            }
        };

        Ok(Self { tag, data })
    }

    /// Write this value with its tag
    pub fn put_tagged(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.tag);
        self.put_untagged(buf);
    }

    /// Write this value without its tag
    pub fn put_untagged(&self, buf: &mut Vec<u8>) {
        match self.data {
            ValueData::Byte(v) => buf.put_i8(v),
            ValueData::Char(v) => buf.put_u16(v),
            ValueData::Float(v) => buf.put_f32(v),
            ValueData::Double(v) => buf.put_f64(v),
            ValueData::Int(v) => buf.put_i32(v),
            ValueData::Long(v) => buf.put_i64(v),
            ValueData::Short(v) => buf.put_i16(v),
            ValueData::Boolean(v) => buf.put_u8(v as u8),
            ValueData::Object(id) => buf.put_u64(id),
            ValueData::Void => {}
        }
    }

    /// Check that the value's tag fits the tag the debugger declared
    pub fn expect_tag(&self, tag: u8) -> JdwpResult<()> {
        if self.tag == tag {
            Ok(())
        } else {
            Err(JdwpError::Command(error_codes::TYPE_MISMATCH))
        }
    }
}

// Stack frame information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_values() {
        let mut buf = Vec::new();
        Value::int(-2).put_tagged(&mut buf);
        Value::object(tags::STRING, 0xabc).put_tagged(&mut buf);
        Value::void().put_tagged(&mut buf);
        assert_eq!(buf.len(), 5 + 9 + 1);

        let mut data = buf.as_slice();
        assert_eq!(Value::read_tagged(&mut data).unwrap(), Value::int(-2));
        let object = Value::read_tagged(&mut data).unwrap();
        assert_eq!(object.object_id(), Some(0xabc));
        assert_eq!(Value::read_tagged(&mut data).unwrap(), Value::void());
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut data: &[u8] = &[b'?', 0, 0];
        assert!(Value::read_tagged(&mut data).is_err());
    }

    #[test]
    fn test_class_ref_signature() {
        let class = ClassRef::new(3, "com.foo.Bar");
        assert_eq!(class.signature, "Lcom/foo/Bar;");
    }
}
