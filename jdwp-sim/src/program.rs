// Scripted debuggee program
//
// A single class `demo.Counter` whose `run` method is executed in a loop by
// every worker thread:
//
//   void run()      { line 1; count += 1; tick(); line 4; return; }
//   void tick()     { line 10; throw+catch Oops; return; }
//   int add(int,int) and void fail() exist only for method invocation.

use jdwp_agent::types::{
    tags, type_tags, ClassRef, FieldId, Location, MethodId, ObjectId, ReferenceTypeId,
};

pub const COUNTER_CLASS: ReferenceTypeId = 0x100;
pub const OOPS_CLASS: ReferenceTypeId = 0x101;
pub const THROWABLE_CLASS: ReferenceTypeId = 0x102;

pub const RUN_METHOD: MethodId = 0x200;
pub const TICK_METHOD: MethodId = 0x201;
pub const ADD_METHOD: MethodId = 0x202;
pub const FAIL_METHOD: MethodId = 0x203;

pub const COUNT_FIELD: FieldId = 0x300;

/// The one `demo.Counter` instance every worker runs on
pub const COUNTER_OBJECT: ObjectId = 0x5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Line,
    /// `field += 1`: reads, then writes the field
    Increment(FieldId),
    Call(MethodId),
    Throw { caught: bool },
    Return,
}

#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub line: i32,
    pub op: Op,
}

const fn at(line: i32, op: Op) -> Instruction {
    Instruction { line, op }
}

#[derive(Debug)]
pub struct MethodDef {
    pub id: MethodId,
    pub name: &'static str,
    pub signature: &'static str,
    pub return_tag: u8,
    pub body: &'static [Instruction],
}

static RUN_BODY: [Instruction; 5] = [
    at(1, Op::Line),
    at(2, Op::Increment(COUNT_FIELD)),
    at(3, Op::Call(TICK_METHOD)),
    at(4, Op::Line),
    at(5, Op::Return),
];

static TICK_BODY: [Instruction; 3] = [
    at(10, Op::Line),
    at(11, Op::Throw { caught: true }),
    at(12, Op::Return),
];

pub static METHODS: [MethodDef; 4] = [
    MethodDef {
        id: RUN_METHOD,
        name: "run",
        signature: "()V",
        return_tag: tags::VOID,
        body: &RUN_BODY,
    },
    MethodDef {
        id: TICK_METHOD,
        name: "tick",
        signature: "()V",
        return_tag: tags::VOID,
        body: &TICK_BODY,
    },
    MethodDef {
        id: ADD_METHOD,
        name: "add",
        signature: "(II)I",
        return_tag: tags::INT,
        body: &[],
    },
    MethodDef {
        id: FAIL_METHOD,
        name: "fail",
        signature: "()V",
        return_tag: tags::VOID,
        body: &[],
    },
];

pub fn method(id: MethodId) -> Option<&'static MethodDef> {
    METHODS.iter().find(|method| method.id == id)
}

pub fn instruction(method_id: MethodId, index: usize) -> Option<Instruction> {
    method(method_id).and_then(|method| method.body.get(index).copied())
}

pub fn location(method_id: MethodId, index: usize) -> Location {
    Location {
        type_tag: type_tags::CLASS,
        class_id: COUNTER_CLASS,
        method_id,
        index: index as u64,
    }
}

pub fn counter_class() -> ClassRef {
    ClassRef::new(COUNTER_CLASS, "demo.Counter").with_source("Counter.java")
}

pub fn classes() -> Vec<ClassRef> {
    vec![
        counter_class(),
        ClassRef::new(OOPS_CLASS, "demo.Oops").with_source("Oops.java"),
        ClassRef::new(THROWABLE_CLASS, "java.lang.Throwable"),
    ]
}
