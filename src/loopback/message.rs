// Message and field entry points of the loopback engine.

use super::engine::{handle_of, id_of, lock, Engine, Object, STATUS_INVALID_ARG};
use crate::ffi::{
    NativeHandle, RawBool, RawStatus, FIELD_TYPE_BOOL, FIELD_TYPE_F64, FIELD_TYPE_I32, FIELD_TYPE_I64,
    FIELD_TYPE_STRING, FIELD_TYPE_VECTOR_I32, STATUS_NOT_FOUND, STATUS_NULL_ARG, STATUS_OK, STATUS_WRONG_FIELD_TYPE,
};
use libc::{c_char, c_double, c_int};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::ptr;

#[derive(Clone)]
pub(crate) enum Value {
    I32(i32),
    I64(i64),
    F64(f64),
    Bool(bool),
    String(CString),
    VectorI32(Vec<i32>),
}

impl Value {
    fn type_tag(&self) -> c_int {
        match self {
            Value::I32(_) => FIELD_TYPE_I32,
            Value::I64(_) => FIELD_TYPE_I64,
            Value::F64(_) => FIELD_TYPE_F64,
            Value::Bool(_) => FIELD_TYPE_BOOL,
            Value::String(_) => FIELD_TYPE_STRING,
            Value::VectorI32(_) => FIELD_TYPE_VECTOR_I32,
        }
    }
}

#[derive(Clone)]
pub(crate) struct FieldData {
    name: Option<CString>,
    fid: u16,
    value: Value,
}

#[derive(Default)]
pub(crate) struct MessageObj {
    fields: Vec<FieldData>,
    /// Field view per index, handed out by `msg_get_field_at` and released
    /// with the message.
    pub field_views: HashMap<usize, u64>,
    /// Inbox a reply to this message goes to.
    pub reply_inbox: Option<u64>,
}

impl MessageObj {
    /// Copy of the payload. Field views are not carried over.
    pub fn copy(&self) -> MessageObj {
        MessageObj {
            fields: self.fields.clone(),
            field_views: HashMap::new(),
            reply_inbox: self.reply_inbox,
        }
    }

    fn find(&self, name: Option<&CStr>, fid: u16) -> Option<&FieldData> {
        self.fields.iter().find(|field| {
            (fid != 0 && field.fid == fid) || (name.is_some() && field.name.as_deref() == name)
        })
    }
}

unsafe fn opt_cstr<'a>(raw: *const c_char) -> Option<&'a CStr> {
    if raw.is_null() {
        None
    } else {
        Some(CStr::from_ptr(raw))
    }
}

fn with_message<F>(msg: NativeHandle, f: F) -> RawStatus
where
    F: FnOnce(&mut MessageObj) -> RawStatus,
{
    let mut engine = lock();
    match engine.message_mut(id_of(msg)) {
        Some(obj) => f(obj),
        None => STATUS_INVALID_ARG,
    }
}

unsafe fn add_field(msg: NativeHandle, name: *const c_char, fid: u16, value: Value) -> RawStatus {
    if name.is_null() && fid == 0 {
        return STATUS_INVALID_ARG;
    }
    let name = opt_cstr(name).map(|n| n.to_owned());
    with_message(msg, |obj| {
        obj.fields.push(FieldData { name, fid, value });
        STATUS_OK
    })
}

/// Look a field up and hand its value to `read`, which reports a type
/// mismatch by returning `None`.
unsafe fn read_field<F>(msg: NativeHandle, name: *const c_char, fid: u16, read: F) -> RawStatus
where
    F: FnOnce(&Value) -> Option<()>,
{
    let name = opt_cstr(name);
    with_message(msg, |obj| match obj.find(name, fid) {
        Some(field) => match read(&field.value) {
            Some(()) => STATUS_OK,
            None => STATUS_WRONG_FIELD_TYPE,
        },
        None => STATUS_NOT_FOUND,
    })
}

pub(crate) unsafe extern "C" fn msg_create(result: *mut NativeHandle) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    let id = lock().insert(Object::Message(MessageObj::default()));
    *result = handle_of(id);
    STATUS_OK
}

pub(crate) unsafe extern "C" fn msg_destroy(msg: NativeHandle) -> RawStatus {
    let mut engine = lock();
    if engine.remove_message(id_of(msg)) {
        STATUS_OK
    } else {
        engine.note_double_destroy("message", id_of(msg))
    }
}

pub(crate) unsafe extern "C" fn msg_clear(msg: NativeHandle) -> RawStatus {
    let mut engine = lock();
    let views = match engine.message_mut(id_of(msg)) {
        Some(obj) => {
            obj.fields.clear();
            std::mem::take(&mut obj.field_views).into_values().collect()
        }
        None => return STATUS_INVALID_ARG,
    };
    drop_views(&mut engine, views);
    STATUS_OK
}

fn drop_views(engine: &mut Engine, views: Vec<u64>) {
    for id in views {
        engine.objects.remove(&id);
    }
}

pub(crate) unsafe extern "C" fn msg_get_num_fields(msg: NativeHandle, result: *mut usize) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    with_message(msg, |obj| {
        *result = obj.fields.len();
        STATUS_OK
    })
}

pub(crate) unsafe extern "C" fn msg_add_i32(msg: NativeHandle, name: *const c_char, fid: u16, value: i32) -> RawStatus {
    add_field(msg, name, fid, Value::I32(value))
}

pub(crate) unsafe extern "C" fn msg_add_i64(msg: NativeHandle, name: *const c_char, fid: u16, value: i64) -> RawStatus {
    add_field(msg, name, fid, Value::I64(value))
}

pub(crate) unsafe extern "C" fn msg_add_f64(
    msg: NativeHandle,
    name: *const c_char,
    fid: u16,
    value: c_double,
) -> RawStatus {
    add_field(msg, name, fid, Value::F64(value))
}

pub(crate) unsafe extern "C" fn msg_add_bool(
    msg: NativeHandle,
    name: *const c_char,
    fid: u16,
    value: RawBool,
) -> RawStatus {
    add_field(msg, name, fid, Value::Bool(value != 0))
}

pub(crate) unsafe extern "C" fn msg_add_string(
    msg: NativeHandle,
    name: *const c_char,
    fid: u16,
    value: *const c_char,
) -> RawStatus {
    if value.is_null() {
        return STATUS_NULL_ARG;
    }
    add_field(msg, name, fid, Value::String(CStr::from_ptr(value).to_owned()))
}

pub(crate) unsafe extern "C" fn msg_add_vector_i32(
    msg: NativeHandle,
    name: *const c_char,
    fid: u16,
    values: *const i32,
    len: usize,
) -> RawStatus {
    let values = if len == 0 {
        Vec::new()
    } else if values.is_null() {
        return STATUS_NULL_ARG;
    } else {
        std::slice::from_raw_parts(values, len).to_vec()
    };
    add_field(msg, name, fid, Value::VectorI32(values))
}

pub(crate) unsafe extern "C" fn msg_get_i32(
    msg: NativeHandle,
    name: *const c_char,
    fid: u16,
    result: *mut i32,
) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    read_field(msg, name, fid, |value| match value {
        Value::I32(v) => {
            *result = *v;
            Some(())
        }
        _ => None,
    })
}

pub(crate) unsafe extern "C" fn msg_get_i64(
    msg: NativeHandle,
    name: *const c_char,
    fid: u16,
    result: *mut i64,
) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    read_field(msg, name, fid, |value| match value {
        Value::I32(v) => {
            *result = i64::from(*v);
            Some(())
        }
        Value::I64(v) => {
            *result = *v;
            Some(())
        }
        _ => None,
    })
}

pub(crate) unsafe extern "C" fn msg_get_f64(
    msg: NativeHandle,
    name: *const c_char,
    fid: u16,
    result: *mut c_double,
) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    read_field(msg, name, fid, |value| match value {
        Value::F64(v) => {
            *result = *v;
            Some(())
        }
        _ => None,
    })
}

pub(crate) unsafe extern "C" fn msg_get_bool(
    msg: NativeHandle,
    name: *const c_char,
    fid: u16,
    result: *mut RawBool,
) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    read_field(msg, name, fid, |value| match value {
        Value::Bool(v) => {
            *result = RawBool::from(*v);
            Some(())
        }
        _ => None,
    })
}

pub(crate) unsafe extern "C" fn msg_get_string(
    msg: NativeHandle,
    name: *const c_char,
    fid: u16,
    result: *mut *const c_char,
) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    // The buffer belongs to the message and stays put until it is mutated
    read_field(msg, name, fid, |value| match value {
        Value::String(v) => {
            *result = v.as_ptr();
            Some(())
        }
        _ => None,
    })
}

pub(crate) unsafe extern "C" fn msg_get_vector_i32(
    msg: NativeHandle,
    name: *const c_char,
    fid: u16,
    result: *mut *const i32,
    len: *mut usize,
) -> RawStatus {
    if result.is_null() || len.is_null() {
        return STATUS_NULL_ARG;
    }
    read_field(msg, name, fid, |value| match value {
        Value::VectorI32(v) => {
            *result = if v.is_empty() { ptr::null() } else { v.as_ptr() };
            *len = v.len();
            Some(())
        }
        _ => None,
    })
}

pub(crate) unsafe extern "C" fn msg_get_field_at(msg: NativeHandle, index: usize, result: *mut NativeHandle) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    let msg_id = id_of(msg);
    let mut engine = lock();
    let existing = match engine.message(msg_id) {
        Some(obj) if index < obj.fields.len() => obj.field_views.get(&index).copied(),
        Some(_) => return STATUS_NOT_FOUND,
        None => return STATUS_INVALID_ARG,
    };
    let field = match existing {
        Some(field) => field,
        None => {
            let field = engine.insert(Object::Field { msg: msg_id, index });
            if let Some(obj) = engine.message_mut(msg_id) {
                obj.field_views.insert(index, field);
            }
            field
        }
    };
    *result = handle_of(field);
    STATUS_OK
}

fn with_field<F>(field: NativeHandle, f: F) -> RawStatus
where
    F: FnOnce(&FieldData) -> RawStatus,
{
    let engine = lock();
    let (msg, index) = match engine.objects.get(&id_of(field)) {
        Some(Object::Field { msg, index }) => (*msg, *index),
        _ => return STATUS_INVALID_ARG,
    };
    match engine.message(msg).and_then(|obj| obj.fields.get(index)) {
        Some(data) => f(data),
        None => STATUS_INVALID_ARG,
    }
}

pub(crate) unsafe extern "C" fn field_get_fid(field: NativeHandle, result: *mut u16) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    with_field(field, |data| {
        *result = data.fid;
        STATUS_OK
    })
}

pub(crate) unsafe extern "C" fn field_get_type(field: NativeHandle, result: *mut c_int) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    with_field(field, |data| {
        *result = data.value.type_tag();
        STATUS_OK
    })
}

pub(crate) unsafe extern "C" fn field_get_name(field: NativeHandle, result: *mut *const c_char) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    with_field(field, |data| {
        *result = data.name.as_ref().map_or(ptr::null(), |name| name.as_ptr());
        STATUS_OK
    })
}

pub(crate) unsafe extern "C" fn field_get_i64(field: NativeHandle, result: *mut i64) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    with_field(field, |data| match data.value {
        Value::I32(v) => {
            *result = i64::from(v);
            STATUS_OK
        }
        Value::I64(v) => {
            *result = v;
            STATUS_OK
        }
        Value::Bool(v) => {
            *result = i64::from(v);
            STATUS_OK
        }
        _ => STATUS_WRONG_FIELD_TYPE,
    })
}

pub(crate) unsafe extern "C" fn field_get_f64(field: NativeHandle, result: *mut c_double) -> RawStatus {
    if result.is_null() {
        return STATUS_NULL_ARG;
    }
    with_field(field, |data| match data.value {
        Value::F64(v) => {
            *result = v;
            STATUS_OK
        }
        Value::I32(v) => {
            *result = f64::from(v);
            STATUS_OK
        }
        Value::I64(v) => {
            *result = v as f64;
            STATUS_OK
        }
        _ => STATUS_WRONG_FIELD_TYPE,
    })
}
