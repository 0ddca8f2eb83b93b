//! Native-call table: the stable numbering shared by the compiler and VM.
//!
//! The compiler lowers qualified `os.…` call paths to `CALL_NATIVE id argc`;
//! the VM dispatches the id to the corresponding [`crate::host::Host`]
//! method (or handles it internally for timers, callbacks, sleep, and
//! yield). Ids are grouped by subsystem in the high byte and are part of
//! the `.dsb` format: never renumber.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Identifier of a host operation, encoded in `CALL_NATIVE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum NativeId {
    // --- Console 0x00xx ---
    ConsolePrint = 0x0000,
    ConsolePrintln = 0x0001,
    ConsoleLog = 0x0002,
    ConsoleWarn = 0x0003,
    ConsoleError = 0x0004,
    ConsoleClear = 0x0005,

    // --- Display 0x01xx ---
    DisplayClear = 0x0100,
    DisplayDrawPixel = 0x0101,
    DisplayDrawLine = 0x0102,
    DisplayDrawRect = 0x0103,
    DisplayDrawCircle = 0x0104,
    DisplayDrawText = 0x0105,
    DisplayDrawImage = 0x0106,
    DisplaySetBrightness = 0x0107,
    DisplaySetTitle = 0x0108,
    DisplayGetWidth = 0x0109,
    DisplayGetHeight = 0x010A,

    // --- Encoder 0x02xx ---
    EncoderGetButton = 0x0200,
    EncoderGetDelta = 0x0201,
    EncoderGetPosition = 0x0202,
    EncoderReset = 0x0203,
    EncoderOnTurn = 0x0204,
    EncoderOnButton = 0x0205,

    // --- Touch 0x03xx ---
    TouchIsPressed = 0x0300,
    TouchGetX = 0x0301,
    TouchGetY = 0x0302,
    TouchOnPress = 0x0303,
    TouchOnDrag = 0x0304,
    TouchOnRelease = 0x0305,

    // --- RFID 0x04xx ---
    RfidIsPresent = 0x0400,
    RfidRead = 0x0401,

    // --- System 0x05xx ---
    SystemGetTime = 0x0500,
    SystemGetRtc = 0x0501,
    SystemSetRtc = 0x0502,
    SystemSleep = 0x0503,
    SystemYield = 0x0504,

    // --- File 0x06xx ---
    FileOpen = 0x0600,
    FileRead = 0x0601,
    FileWrite = 0x0602,
    FileClose = 0x0603,
    FileExists = 0x0604,
    FileDelete = 0x0605,
    FileSize = 0x0606,

    // --- Directory 0x07xx ---
    DirList = 0x0700,
    DirCreate = 0x0701,
    DirDelete = 0x0702,
    DirExists = 0x0703,

    // --- GPIO 0x08xx ---
    GpioPinMode = 0x0800,
    GpioDigitalWrite = 0x0801,
    GpioDigitalRead = 0x0802,
    GpioAnalogRead = 0x0803,
    GpioAnalogWrite = 0x0804,

    // --- I2C 0x09xx ---
    I2cBegin = 0x0900,
    I2cWrite = 0x0901,
    I2cRead = 0x0902,
    I2cScan = 0x0903,

    // --- Buzzer 0x0Axx ---
    BuzzerTone = 0x0A00,
    BuzzerNoTone = 0x0A01,
    BuzzerBeep = 0x0A02,

    // --- Timers 0x0Bxx (handled inside the VM) ---
    TimerSetInterval = 0x0B00,
    TimerSetTimeout = 0x0B01,
    TimerClearInterval = 0x0B02,
    TimerClearTimeout = 0x0B03,

    // --- Memory 0x0Cxx ---
    MemoryGetFree = 0x0C00,
    MemoryGetUsed = 0x0C01,

    // --- Power 0x0Dxx ---
    PowerGetBatteryLevel = 0x0D00,
    PowerIsCharging = 0x0D01,
    PowerReboot = 0x0D02,

    // --- Storage 0x0Exx ---
    StorageGet = 0x0E00,
    StorageSet = 0x0E01,
    StorageRemove = 0x0E02,
    StorageClear = 0x0E03,

    // --- Sensors 0x0Fxx ---
    SensorReadTemperature = 0x0F00,
    SensorReadLight = 0x0F01,

    // --- WiFi 0x10xx ---
    WifiConnect = 0x1000,
    WifiDisconnect = 0x1001,
    WifiIsConnected = 0x1002,
    WifiGetIp = 0x1003,

    // --- HTTP 0x11xx ---
    HttpGet = 0x1100,
    HttpPost = 0x1101,

    // --- IPC 0x12xx ---
    IpcSend = 0x1200,
    IpcReceive = 0x1201,

    // --- App lifecycle 0x13xx ---
    AppExit = 0x1300,
    AppLaunch = 0x1301,
    AppList = 0x1302,
    AppOnLoad = 0x1303,
    AppOnExit = 0x1304,
}

/// Qualified script path → native id. The compiler consults this when a
/// call's callee is a member chain rooted at `os`.
pub const NATIVE_PATHS: &[(&str, NativeId)] = &[
    ("os.console.print", NativeId::ConsolePrint),
    ("os.console.println", NativeId::ConsolePrintln),
    ("os.console.log", NativeId::ConsoleLog),
    ("os.console.warn", NativeId::ConsoleWarn),
    ("os.console.error", NativeId::ConsoleError),
    ("os.console.clear", NativeId::ConsoleClear),
    ("os.display.clear", NativeId::DisplayClear),
    ("os.display.drawPixel", NativeId::DisplayDrawPixel),
    ("os.display.drawLine", NativeId::DisplayDrawLine),
    ("os.display.drawRect", NativeId::DisplayDrawRect),
    ("os.display.drawCircle", NativeId::DisplayDrawCircle),
    ("os.display.drawText", NativeId::DisplayDrawText),
    ("os.display.drawImage", NativeId::DisplayDrawImage),
    ("os.display.setBrightness", NativeId::DisplaySetBrightness),
    ("os.display.setTitle", NativeId::DisplaySetTitle),
    ("os.display.getWidth", NativeId::DisplayGetWidth),
    ("os.display.getHeight", NativeId::DisplayGetHeight),
    ("os.encoder.getButton", NativeId::EncoderGetButton),
    ("os.encoder.getDelta", NativeId::EncoderGetDelta),
    ("os.encoder.getPosition", NativeId::EncoderGetPosition),
    ("os.encoder.reset", NativeId::EncoderReset),
    ("os.encoder.onTurn", NativeId::EncoderOnTurn),
    ("os.encoder.onButton", NativeId::EncoderOnButton),
    ("os.touch.isPressed", NativeId::TouchIsPressed),
    ("os.touch.getX", NativeId::TouchGetX),
    ("os.touch.getY", NativeId::TouchGetY),
    ("os.touch.onPress", NativeId::TouchOnPress),
    ("os.touch.onDrag", NativeId::TouchOnDrag),
    ("os.touch.onRelease", NativeId::TouchOnRelease),
    ("os.rfid.isPresent", NativeId::RfidIsPresent),
    ("os.rfid.read", NativeId::RfidRead),
    ("os.system.getTime", NativeId::SystemGetTime),
    ("os.system.getRTC", NativeId::SystemGetRtc),
    ("os.system.setRTC", NativeId::SystemSetRtc),
    ("os.system.sleep", NativeId::SystemSleep),
    ("os.system.yield", NativeId::SystemYield),
    ("os.file.open", NativeId::FileOpen),
    ("os.file.read", NativeId::FileRead),
    ("os.file.write", NativeId::FileWrite),
    ("os.file.close", NativeId::FileClose),
    ("os.file.exists", NativeId::FileExists),
    ("os.file.delete", NativeId::FileDelete),
    ("os.file.size", NativeId::FileSize),
    ("os.dir.list", NativeId::DirList),
    ("os.dir.create", NativeId::DirCreate),
    ("os.dir.delete", NativeId::DirDelete),
    ("os.dir.exists", NativeId::DirExists),
    ("os.gpio.pinMode", NativeId::GpioPinMode),
    ("os.gpio.digitalWrite", NativeId::GpioDigitalWrite),
    ("os.gpio.digitalRead", NativeId::GpioDigitalRead),
    ("os.gpio.analogRead", NativeId::GpioAnalogRead),
    ("os.gpio.analogWrite", NativeId::GpioAnalogWrite),
    ("os.i2c.begin", NativeId::I2cBegin),
    ("os.i2c.write", NativeId::I2cWrite),
    ("os.i2c.read", NativeId::I2cRead),
    ("os.i2c.scan", NativeId::I2cScan),
    ("os.buzzer.tone", NativeId::BuzzerTone),
    ("os.buzzer.noTone", NativeId::BuzzerNoTone),
    ("os.buzzer.beep", NativeId::BuzzerBeep),
    ("os.timer.setInterval", NativeId::TimerSetInterval),
    ("os.timer.setTimeout", NativeId::TimerSetTimeout),
    ("os.timer.clearInterval", NativeId::TimerClearInterval),
    ("os.timer.clearTimeout", NativeId::TimerClearTimeout),
    ("os.memory.getFree", NativeId::MemoryGetFree),
    ("os.memory.getUsed", NativeId::MemoryGetUsed),
    ("os.power.getBatteryLevel", NativeId::PowerGetBatteryLevel),
    ("os.power.isCharging", NativeId::PowerIsCharging),
    ("os.power.reboot", NativeId::PowerReboot),
    ("os.storage.get", NativeId::StorageGet),
    ("os.storage.set", NativeId::StorageSet),
    ("os.storage.remove", NativeId::StorageRemove),
    ("os.storage.clear", NativeId::StorageClear),
    ("os.sensor.readTemperature", NativeId::SensorReadTemperature),
    ("os.sensor.readLight", NativeId::SensorReadLight),
    ("os.wifi.connect", NativeId::WifiConnect),
    ("os.wifi.disconnect", NativeId::WifiDisconnect),
    ("os.wifi.isConnected", NativeId::WifiIsConnected),
    ("os.wifi.getIP", NativeId::WifiGetIp),
    ("os.http.get", NativeId::HttpGet),
    ("os.http.post", NativeId::HttpPost),
    ("os.ipc.send", NativeId::IpcSend),
    ("os.ipc.receive", NativeId::IpcReceive),
    ("os.app.exit", NativeId::AppExit),
    ("os.app.launch", NativeId::AppLaunch),
    ("os.app.list", NativeId::AppList),
    ("os.app.onLoad", NativeId::AppOnLoad),
    ("os.app.onExit", NativeId::AppOnExit),
];

/// Look up a native id by its qualified script path.
pub fn native_for_path(path: &str) -> Option<NativeId> {
    NATIVE_PATHS
        .iter()
        .find(|(p, _)| *p == path)
        .map(|(_, id)| *id)
}

/// The well-known callback-registration natives and the event names they
/// bind. Shared by the VM (registration) and the engine (delivery).
pub const CALLBACK_EVENTS: &[(NativeId, &str)] = &[
    (NativeId::EncoderOnTurn, "encoder.onTurn"),
    (NativeId::EncoderOnButton, "encoder.onButton"),
    (NativeId::TouchOnPress, "touch.onPress"),
    (NativeId::TouchOnDrag, "touch.onDrag"),
    (NativeId::TouchOnRelease, "touch.onRelease"),
    (NativeId::AppOnLoad, "app.onLoad"),
    (NativeId::AppOnExit, "app.onExit"),
];

/// Event name bound by a callback-registration native, if it is one.
pub fn callback_event(id: NativeId) -> Option<&'static str> {
    CALLBACK_EVENTS
        .iter()
        .find(|(native, _)| *native == id)
        .map(|(_, event)| *event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_lookup() {
        assert_eq!(
            native_for_path("os.console.print"),
            Some(NativeId::ConsolePrint)
        );
        assert_eq!(native_for_path("os.console.missing"), None);
    }

    #[test]
    fn ids_round_trip_through_u16() {
        for (_, id) in NATIVE_PATHS {
            let raw: u16 = (*id).into();
            assert_eq!(NativeId::try_from(raw), Ok(*id));
        }
    }

    #[test]
    fn paths_are_unique() {
        for (i, (path, _)) in NATIVE_PATHS.iter().enumerate() {
            assert!(
                !NATIVE_PATHS[i + 1..].iter().any(|(p, _)| p == path),
                "duplicate path {path}"
            );
        }
    }

    #[test]
    fn callback_events_are_registration_natives() {
        assert_eq!(
            callback_event(NativeId::EncoderOnTurn),
            Some("encoder.onTurn")
        );
        assert_eq!(callback_event(NativeId::ConsolePrint), None);
    }
}
