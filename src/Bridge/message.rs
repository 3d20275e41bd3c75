use super::marshal::{copy_c_str, opt_c_string, opt_ptr, c_string};
use super::Bridge;
use crate::ffi::{self, NativeApi, NativeHandle, RawStatus};
use crate::Core::{check, check_found, BridgeError, NativeWrapper, Ownership, PeerHandle, Result, Status};
use libc::{c_char, c_int};
use std::ptr;
use std::sync::Arc;

/// Value type of a message field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    I32,
    I64,
    F64,
    Bool,
    String,
    VectorI32,
    Unknown(c_int),
}

impl FieldType {
    pub fn from_raw(raw: c_int) -> Self {
        match raw {
            ffi::FIELD_TYPE_I32 => FieldType::I32,
            ffi::FIELD_TYPE_I64 => FieldType::I64,
            ffi::FIELD_TYPE_F64 => FieldType::F64,
            ffi::FIELD_TYPE_BOOL => FieldType::Bool,
            ffi::FIELD_TYPE_STRING => FieldType::String,
            ffi::FIELD_TYPE_VECTOR_I32 => FieldType::VectorI32,
            other => FieldType::Unknown(other),
        }
    }
}

type Getter<T> = unsafe extern "C" fn(NativeHandle, *const c_char, u16, *mut T) -> RawStatus;
type Adder<T> = unsafe extern "C" fn(NativeHandle, *const c_char, u16, T) -> RawStatus;

/// A native message.
///
/// Fields are addressed by name, by field id, or both; whichever the engine
/// matches first wins.
pub struct Message {
    bridge: Bridge,
    peer: Arc<PeerHandle>,
}

impl Message {
    pub fn new(bridge: &Bridge) -> Result<Message> {
        let api = bridge.api();
        let peer = PeerHandle::new("message", api.msg_destroy);
        peer.create(|out| unsafe { (api.msg_create)(out) })?;
        Ok(Message {
            bridge: bridge.clone(),
            peer: Arc::new(peer),
        })
    }

    /// Wrap a message handle obtained from the engine.
    ///
    /// # Safety
    /// `handle` must name a live native message. With `Ownership::Owned` the
    /// caller hands over the responsibility to destroy it.
    pub unsafe fn from_native(bridge: &Bridge, handle: NativeHandle, ownership: Ownership) -> Message {
        let peer = match ownership {
            Ownership::NotOwned => PeerHandle::view("message", handle),
            _ => PeerHandle::from_native("message", bridge.api().msg_destroy, handle, ownership),
        };
        Message {
            bridge: bridge.clone(),
            peer: Arc::new(peer),
        }
    }

    /// Non-owning view; used for messages the engine lends to callbacks.
    pub(crate) fn view(bridge: &Bridge, handle: NativeHandle) -> Message {
        Message {
            bridge: bridge.clone(),
            peer: Arc::new(PeerHandle::view("message", handle)),
        }
    }

    pub(crate) fn from_peer(bridge: &Bridge, peer: Arc<PeerHandle>) -> Message {
        Message {
            bridge: bridge.clone(),
            peer,
        }
    }

    pub(crate) fn shared_peer(&self) -> &Arc<PeerHandle> {
        &self.peer
    }

    pub fn native_handle(&self) -> Result<NativeHandle> {
        self.peer.ensure_created()
    }

    pub fn ownership(&self) -> Ownership {
        self.peer.ownership()
    }

    /// Point this wrapper at another native message without destroying the
    /// current one.
    ///
    /// # Safety
    /// `handle` must name a live native message for as long as it is used
    /// through this wrapper.
    pub unsafe fn set_native_handle(&self, handle: NativeHandle) {
        self.peer.set_native_handle(handle);
    }

    /// `false` leaves destruction of the native message to someone else.
    pub fn self_manage_lifetime(&self, self_managed: bool) -> Result<()> {
        self.peer.set_self_managed(self_managed)
    }

    pub fn num_fields(&self) -> Result<usize> {
        let handle = self.native_handle()?;
        let mut count = 0usize;
        check(unsafe { (self.api().msg_get_num_fields)(handle, &mut count) })?;
        Ok(count)
    }

    pub fn clear(&self) -> Result<()> {
        let handle = self.native_handle()?;
        check(unsafe { (self.api().msg_clear)(handle) })
    }

    pub fn add_i32(&self, name: Option<&str>, fid: u16, value: i32) -> Result<()> {
        self.add(name, fid, value, self.api().msg_add_i32)
    }

    pub fn add_i64(&self, name: Option<&str>, fid: u16, value: i64) -> Result<()> {
        self.add(name, fid, value, self.api().msg_add_i64)
    }

    pub fn add_f64(&self, name: Option<&str>, fid: u16, value: f64) -> Result<()> {
        self.add(name, fid, value, self.api().msg_add_f64)
    }

    pub fn add_bool(&self, name: Option<&str>, fid: u16, value: bool) -> Result<()> {
        self.add(name, fid, value as ffi::RawBool, self.api().msg_add_bool)
    }

    pub fn add_string(&self, name: Option<&str>, fid: u16, value: &str) -> Result<()> {
        let value = c_string(value, "string field value")?;
        let add = self.api().msg_add_string;
        let code = self.with_field_name(name, fid, |handle, name| unsafe { add(handle, name, fid, value.as_ptr()) })?;
        check(code)
    }

    pub fn add_vector_i32(&self, name: Option<&str>, fid: u16, values: &[i32]) -> Result<()> {
        let add = self.api().msg_add_vector_i32;
        let code = self.with_field_name(name, fid, |handle, name| unsafe {
            add(handle, name, fid, values.as_ptr(), values.len())
        })?;
        check(code)
    }

    pub fn get_i32(&self, name: Option<&str>, fid: u16) -> Result<i32> {
        required(self.try_i32(name, fid)?)
    }

    pub fn try_i32(&self, name: Option<&str>, fid: u16) -> Result<Option<i32>> {
        self.fetch(name, fid, self.api().msg_get_i32)
    }

    pub fn get_i64(&self, name: Option<&str>, fid: u16) -> Result<i64> {
        required(self.try_i64(name, fid)?)
    }

    pub fn try_i64(&self, name: Option<&str>, fid: u16) -> Result<Option<i64>> {
        self.fetch(name, fid, self.api().msg_get_i64)
    }

    pub fn get_f64(&self, name: Option<&str>, fid: u16) -> Result<f64> {
        required(self.try_f64(name, fid)?)
    }

    pub fn try_f64(&self, name: Option<&str>, fid: u16) -> Result<Option<f64>> {
        self.fetch(name, fid, self.api().msg_get_f64)
    }

    pub fn get_bool(&self, name: Option<&str>, fid: u16) -> Result<bool> {
        required(self.try_bool(name, fid)?)
    }

    pub fn try_bool(&self, name: Option<&str>, fid: u16) -> Result<Option<bool>> {
        Ok(self.fetch(name, fid, self.api().msg_get_bool)?.map(|raw| raw != 0))
    }

    pub fn get_string(&self, name: Option<&str>, fid: u16) -> Result<String> {
        required(self.try_string(name, fid)?)
    }

    pub fn try_string(&self, name: Option<&str>, fid: u16) -> Result<Option<String>> {
        let get = self.api().msg_get_string;
        let mut raw: *const c_char = ptr::null();
        let code = self.with_field_name(name, fid, |handle, name| unsafe { get(handle, name, fid, &mut raw) })?;
        if !check_found(code)? {
            return Ok(None);
        }
        // Copied before anything else can touch the message
        Ok(Some(unsafe { copy_c_str(raw) }))
    }

    pub fn get_vector_i32(&self, name: Option<&str>, fid: u16) -> Result<Vec<i32>> {
        required(self.try_vector_i32(name, fid)?)
    }

    pub fn try_vector_i32(&self, name: Option<&str>, fid: u16) -> Result<Option<Vec<i32>>> {
        let get = self.api().msg_get_vector_i32;
        let mut raw: *const i32 = ptr::null();
        let mut len = 0usize;
        let code = self.with_field_name(name, fid, |handle, name| unsafe {
            get(handle, name, fid, &mut raw, &mut len)
        })?;
        if !check_found(code)? {
            return Ok(None);
        }
        if raw.is_null() || len == 0 {
            return Ok(Some(Vec::new()));
        }
        Ok(Some(unsafe { std::slice::from_raw_parts(raw, len) }.to_vec()))
    }

    /// Visit every field through one reusable view that is rebound to each
    /// native field in turn.
    pub fn for_each_field<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&MessageField) -> Result<()>,
    {
        let handle = self.native_handle()?;
        let count = self.num_fields()?;
        let field = MessageField::view(&self.bridge, NativeHandle::NULL);
        for index in 0..count {
            let mut raw = NativeHandle::NULL;
            check(unsafe { (self.api().msg_get_field_at)(handle, index, &mut raw) })?;
            field.peer.set_native_handle(raw);
            visit(&field)?;
        }
        Ok(())
    }

    fn add<T>(&self, name: Option<&str>, fid: u16, value: T, add: Adder<T>) -> Result<()> {
        let code = self.with_field_name(name, fid, |handle, name| unsafe { add(handle, name, fid, value) })?;
        check(code)
    }

    fn fetch<T: Default>(&self, name: Option<&str>, fid: u16, get: Getter<T>) -> Result<Option<T>> {
        let mut out = T::default();
        let code = self.with_field_name(name, fid, |handle, name| unsafe { get(handle, name, fid, &mut out) })?;
        if check_found(code)? {
            Ok(Some(out))
        } else {
            Ok(None)
        }
    }

    fn with_field_name<R, F>(&self, name: Option<&str>, fid: u16, call: F) -> Result<R>
    where
        F: FnOnce(NativeHandle, *const c_char) -> R,
    {
        if self.bridge.check_arguments() && name.is_none() && fid == 0 {
            return Err(BridgeError::InvalidArgument("field needs a name or a non-zero fid"));
        }
        let handle = self.native_handle()?;
        let name = opt_c_string(name, "field name")?;
        Ok(call(handle, opt_ptr(&name)))
    }

    fn api(&self) -> &'static NativeApi {
        self.bridge.api()
    }
}

fn required<T>(value: Option<T>) -> Result<T> {
    value.ok_or(BridgeError::Native(Status::NotFound))
}

impl NativeWrapper for Message {
    fn peer(&self) -> &PeerHandle {
        &self.peer
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_message(self, f)
    }
}

/// View over one field of a message. Only valid inside
/// [`Message::for_each_field`].
pub struct MessageField {
    bridge: Bridge,
    peer: PeerHandle,
}

impl MessageField {
    fn view(bridge: &Bridge, handle: NativeHandle) -> Self {
        Self {
            bridge: bridge.clone(),
            peer: PeerHandle::view("message_field", handle),
        }
    }

    pub fn fid(&self) -> Result<u16> {
        let handle = self.peer.ensure_created()?;
        let mut fid = 0u16;
        check(unsafe { (self.bridge.api().field_get_fid)(handle, &mut fid) })?;
        Ok(fid)
    }

    pub fn field_type(&self) -> Result<FieldType> {
        let handle = self.peer.ensure_created()?;
        let mut raw: c_int = 0;
        check(unsafe { (self.bridge.api().field_get_type)(handle, &mut raw) })?;
        Ok(FieldType::from_raw(raw))
    }

    pub fn name(&self) -> Result<String> {
        let handle = self.peer.ensure_created()?;
        let mut raw: *const c_char = ptr::null();
        check(unsafe { (self.bridge.api().field_get_name)(handle, &mut raw) })?;
        Ok(unsafe { copy_c_str(raw) })
    }

    /// Integer value, widened to 64 bits.
    pub fn as_i64(&self) -> Result<i64> {
        let handle = self.peer.ensure_created()?;
        let mut value = 0i64;
        check(unsafe { (self.bridge.api().field_get_i64)(handle, &mut value) })?;
        Ok(value)
    }

    pub fn as_f64(&self) -> Result<f64> {
        let handle = self.peer.ensure_created()?;
        let mut value = 0f64;
        check(unsafe { (self.bridge.api().field_get_f64)(handle, &mut value) })?;
        Ok(value)
    }

    pub fn native_handle(&self) -> NativeHandle {
        self.peer.handle()
    }
}
