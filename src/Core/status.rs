// Status taxonomy of the native engine.
//
// Zero is success; every other value maps onto a fixed code. Codes the
// bridge does not know are preserved as `Unknown` so nothing is lost on the
// way to the caller.

use crate::ffi::RawStatus;
use std::fmt;

macro_rules! statuses {
    ($($variant:ident = $code:expr => $name:expr,)*) => {
        /// Status code returned by a native entry point or delivered to an
        /// asynchronous callback.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Status {
            $($variant,)*
            Unknown(i32),
        }

        impl Status {
            pub fn from_code(code: RawStatus) -> Self {
                match code {
                    $($code => Status::$variant,)*
                    other => Status::Unknown(other),
                }
            }

            pub fn code(self) -> RawStatus {
                match self {
                    $(Status::$variant => $code,)*
                    Status::Unknown(other) => other,
                }
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Status::$variant => $name,)*
                    Status::Unknown(_) => "UNKNOWN",
                }
            }
        }
    };
}

statuses! {
    Ok = 0 => "STATUS_OK",
    NoMem = 1 => "NOMEM",
    Platform = 2 => "PLATFORM",
    SystemError = 3 => "SYSTEM_ERROR",
    InvalidArg = 4 => "INVALID_ARG",
    NullArg = 5 => "NULL_ARG",
    NotFound = 6 => "NOT_FOUND",
    TimerFailure = 7 => "TIMER_FAILURE",
    IpNotFound = 8 => "IP_NOT_FOUND",
    Timeout = 9 => "TIMEOUT",
    NotEntitled = 10 => "NOT_ENTITLED",
    PropertyTooLong = 11 => "PROPERTY_TOO_LONG",
    MdNotOpened = 12 => "MD_NOT_OPENED",
    PubSubNotOpened = 13 => "PUB_SUB_NOT_OPENED",
    EntitlementsNotEnabled = 14 => "ENTITLEMENTS_NOT_ENABLED",
    BadTransportType = 15 => "BAD_TRANSPORT_TYPE",
    UnsupportedIoType = 16 => "UNSUPPORTED_IO_TYPE",
    TooManyDispatchers = 17 => "TOO_MANY_DISPATCHERS",
    NotImplemented = 18 => "NOT_IMPLEMENTED",
    WrongFieldType = 19 => "WRONG_FIELD_TYPE",
    BadSymbol = 20 => "BAD_SYMBOL",
    IoError = 21 => "IO_ERROR",
    NotInstalled = 22 => "NOT_INSTALLED",
    ConflateError = 23 => "CONFLATE_ERROR",
    QueueFull = 24 => "QUEUE_FULL",
    QueueEnd = 25 => "QUEUE_END",
    NoBridgeImpl = 26 => "NO_BRIDGE_IMPL",
    InvalidQueue = 27 => "INVALID_QUEUE",
    NotModifiable = 28 => "NOT_MODIFIABLE",
    Delete = 29 => "DELETE",
    NotPermissioned = 4001 => "NOT_PERMISSIONED",
    SubscriptionInvalidState = 5001 => "SUBSCRIPTION_INVALID_STATE",
    QueueOpenObjects = 5002 => "QUEUE_OPEN_OBJECTS",
    SubscriptionInvalidType = 5003 => "SUBSCRIPTION_INVALID_TYPE",
    SubscriptionGap = 5004 => "SUBSCRIPTION_GAP",
    NotInitialised = 5005 => "NOT_INITIALISED",
    NoSubscribers = 5006 => "NO_SUBSCRIBERS",
    Expired = 5007 => "EXPIRED",
    BandwidthExceeded = 5008 => "BANDWIDTH_EXCEEDED",
    EntitleNoMem = 9001 => "ENTITLE_NOMEM",
    EntitleBadParam = 9002 => "ENTITLE_BAD_PARAM",
    EntitleBadData = 9003 => "ENTITLE_BAD_DATA",
    EntitleUrlError = 9004 => "ENTITLE_URL_ERROR",
    EntitleOsLoginIdUnavailable = 9005 => "ENTITLE_OS_LOGIN_ID_UNAVAILABLE",
    EntitleAlreadyEntitled = 9006 => "ENTITLE_ALREADY_ENTITLED",
    EntitleCacLimitExceeded = 9007 => "ENTITLE_CAC_LIMIT_EXCEEDED",
    EntitleOepListenerCreationFailure = 9008 => "ENTITLE_OEP_LISTENER_CREATION_FAILURE",
    EntitleHttpErrHost = 9010 => "ENTITLE_HTTP_ERRHOST",
    EntitleHttpErrSock = 9011 => "ENTITLE_HTTP_ERRSOCK",
    EntitleHttpErrConn = 9012 => "ENTITLE_HTTP_ERRCONN",
    EntitleHttpErrWrhd = 9013 => "ENTITLE_HTTP_ERRWRHD",
    EntitleHttpErrWrdt = 9014 => "ENTITLE_HTTP_ERRWRDT",
    EntitleHttpErrRdhd = 9015 => "ENTITLE_HTTP_ERRRDHD",
    EntitleHttpErrPahd = 9016 => "ENTITLE_HTTP_ERRPAHD",
    EntitleHttpErrNull = 9017 => "ENTITLE_HTTP_ERRNULL",
    EntitleHttpErrNolg = 9018 => "ENTITLE_HTTP_ERRNOLG",
    EntitleHttpErrMem = 9019 => "ENTITLE_HTTP_ERRMEM",
    EntitleHttpErrRddt = 9020 => "ENTITLE_HTTP_ERRRDDT",
    EntitleHttpErrUrlh = 9021 => "ENTITLE_HTTP_ERRURLH",
    EntitleHttpErrUrlp = 9022 => "ENTITLE_HTTP_ERRURLP",
    EntitleHttpBadQuery = 9023 => "ENTITLE_HTTP_BAD_QUERY",
    EntitleHttpForbidden = 9024 => "ENTITLE_HTTP_FORBIDDEN",
    EntitleHttpTimeout = 9025 => "ENTITLE_HTTP_TIMEOUT",
    EntitleHttpServerErr = 9026 => "ENTITLE_HTTP_SERVER_ERR",
    EntitleHttpNoImpl = 9027 => "ENTITLE_HTTP_NO_IMPL",
    EntitleHttpOverload = 9028 => "ENTITLE_HTTP_OVERLOAD",
    EntitleNoUser = 9029 => "ENTITLE_NO_USER",
    EntitleNoServersSpecified = 9030 => "ENTITLE_NO_SERVERS_SPECIFIED",
    EntitleSiteNotFound = 9032 => "ENTITLE_SITE_NOT_FOUND",
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Entitlement failures, including the platform-level "not permissioned".
    pub fn is_entitlement(self) -> bool {
        matches!(self.code(), 4001 | 9001..=9099) || self == Status::NotEntitled
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

impl From<RawStatus> for Status {
    fn from(code: RawStatus) -> Self {
        Status::from_code(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip() {
        for code in [0, 6, 9, 19, 29, 4001, 5002, 5008, 9001, 9032] {
            let status = Status::from_code(code);
            assert!(!matches!(status, Status::Unknown(_)), "code {} should be known", code);
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn unknown_codes_are_preserved() {
        // 9009 and 9031 are gaps in the entitlement range
        for code in [30, 9009, 9031, -1] {
            assert_eq!(Status::from_code(code), Status::Unknown(code));
            assert_eq!(Status::from_code(code).code(), code);
        }
    }

    #[test]
    fn display_names_the_code() {
        assert_eq!(Status::NotFound.to_string(), "NOT_FOUND (6)");
        assert_eq!(Status::Unknown(42).to_string(), "UNKNOWN (42)");
    }

    #[test]
    fn entitlement_classification() {
        assert!(Status::NotEntitled.is_entitlement());
        assert!(Status::NotPermissioned.is_entitlement());
        assert!(Status::EntitleHttpForbidden.is_entitlement());
        assert!(!Status::Timeout.is_entitlement());
    }
}
