//! Implements the MLX90393 multi-sensor feature (ID `0x9209`) exposing the
//! Melexis 3D hall sensors of analog keys and triggers to test software.

use std::{sync::Arc, time::Duration};

use super::{CreatableFeature, EventApi, Feature, FeatureModel, FunctionApi, VersionApi};
use crate::{
    channel::{ChannelError, UsbChannel},
    field::{BitField, Check},
    schema::{FieldSet, HIDPP_HEADER, Request, fid, hidpp_message},
};

/// The protocol ID of the feature.
pub const FEATURE_ID: u16 = 0x9209;

const P: u8 = fid::FIRST_PAYLOAD;

const BYTE: &[Check] = &[Check::ByteLength(1)];
const WORD: &[Check] = &[Check::ByteLength(2)];
const DWORD: &[Check] = &[Check::ByteLength(4)];
const BIT: &[Check] = &[Check::Range { min: 0, max: 1 }];
const PARAMETERS: &[Check] = &[Check::ByteLength(6)];

const READ_SENSOR_REGISTER_FIELDS: &[BitField] = &[
    BitField::new(P, "sensor_id", 8).with_checks(BYTE),
    BitField::new(P - 1, "reg_addr", 8).with_checks(BYTE),
    BitField::new(P - 2, "padding", 8).with_default(0),
];

const READ_WRITE_SENSOR_FIELDS: &[BitField] = &[
    BitField::new(P, "sensor_id", 8).with_checks(BYTE),
    BitField::new(P - 1, "reg_addr", 8).with_checks(BYTE),
    BitField::new(P - 2, "reg_value", 16).with_checks(WORD),
    BitField::new(P - 3, "padding", 96).with_default(0),
];

const SENSOR_REQUEST_FIELDS: &[BitField] = &[
    BitField::new(P, "sensor_id", 8).with_checks(BYTE),
    BitField::new(P - 1, "padding", 16).with_default(0),
];

const SENSOR_RESPONSE_FIELDS: &[BitField] = &[
    BitField::new(P, "sensor_id", 8).with_checks(BYTE),
    BitField::new(P - 1, "padding", 120).with_default(0),
];

const MONITOR_TEST_FIELDS: &[BitField] = &[
    BitField::new(P, "sensor_id", 8).with_checks(BYTE),
    BitField::new(P - 1, "count", 16).with_checks(WORD),
    BitField::new(P - 2, "threshold", 8).with_checks(BYTE),
    BitField::new(P - 3, "padding", 96).with_default(0),
];

const CALIBRATION_DATA_FIELDS: &[BitField] = &[
    BitField::new(P, "sensor_id", 8).with_checks(BYTE),
    BitField::new(P - 1, "calibration_data", 32).with_checks(DWORD),
    BitField::new(P - 2, "padding", 88).with_default(0),
];

const CALIBRATE_FIELDS: &[BitField] = &[
    BitField::new(P, "sensor_id", 8).with_checks(BYTE),
    BitField::new(P - 1, "ref_point_id", 8).with_checks(BYTE),
    BitField::new(P - 2, "ref_point_out_value", 8).with_checks(BYTE),
];

const CALIBRATE_RESPONSE_FIELDS: &[BitField] = &[BitField::new(P, "padding", 128).with_default(0)];

const MANAGE_DYN_CALL_PARAM_FIELDS: &[BitField] = &[
    BitField::new(P, "command", 1).with_checks(BIT),
    BitField::new(P - 1, "sensor_id", 1).with_checks(BIT),
    BitField::new(P - 2, "reserved", 6).with_default(0),
    BitField::new(P - 3, "parameters", 48).with_checks(PARAMETERS),
    BitField::new(P - 4, "padding", 72).with_default(0),
];

const MONITOR_REPORT_FIELDS: &[BitField] = &[
    BitField::new(P, "sensor_id", 8).with_checks(BYTE),
    BitField::new(P - 1, "axis_x", 16).with_checks(WORD),
    BitField::new(P - 2, "axis_y", 16).with_checks(WORD),
    BitField::new(P - 3, "axis_z", 16).with_checks(WORD),
    BitField::new(P - 4, "temperature", 16).with_checks(WORD),
    BitField::new(P - 5, "arc_tangent", 16).with_checks(WORD),
    BitField::new(P - 6, "reserved", 24).with_default(0),
    BitField::new(P - 7, "counter", 16).with_checks(WORD),
];

static READ_SENSOR_REGISTER_FORMAT: FieldSet = FieldSet::new(
    "ReadSensorRegisterFormat",
    Some(&HIDPP_HEADER),
    READ_SENSOR_REGISTER_FIELDS,
);
static READ_WRITE_SENSOR_FORMAT: FieldSet = FieldSet::new(
    "ReadWriteSensorFormat",
    Some(&HIDPP_HEADER),
    READ_WRITE_SENSOR_FIELDS,
);
static SENSOR_REQUEST_FORMAT: FieldSet = FieldSet::new(
    "SensorRequestFormat",
    Some(&HIDPP_HEADER),
    SENSOR_REQUEST_FIELDS,
);
static SENSOR_RESPONSE_FORMAT: FieldSet = FieldSet::new(
    "SensorResponseFormat",
    Some(&HIDPP_HEADER),
    SENSOR_RESPONSE_FIELDS,
);
static MONITOR_TEST_FORMAT: FieldSet = FieldSet::new(
    "MonitorTestFormat",
    Some(&HIDPP_HEADER),
    MONITOR_TEST_FIELDS,
);
static CALIBRATION_DATA_FORMAT: FieldSet = FieldSet::new(
    "CalibrationDataFormat",
    Some(&HIDPP_HEADER),
    CALIBRATION_DATA_FIELDS,
);
static CALIBRATE_FORMAT: FieldSet = FieldSet::new("CalibrateFormat", Some(&HIDPP_HEADER), CALIBRATE_FIELDS);
static CALIBRATE_RESPONSE_FORMAT: FieldSet = FieldSet::new(
    "CalibrateResponseFormat",
    Some(&HIDPP_HEADER),
    CALIBRATE_RESPONSE_FIELDS,
);
static MANAGE_DYN_CALL_PARAM_FORMAT: FieldSet = FieldSet::new(
    "ManageDynCallParamFormat",
    Some(&HIDPP_HEADER),
    MANAGE_DYN_CALL_PARAM_FIELDS,
);
static MONITOR_REPORT_FORMAT: FieldSet = FieldSet::new(
    "MonitorReportFormat",
    Some(&HIDPP_HEADER),
    MONITOR_REPORT_FIELDS,
);

/// Declares the request and response of one function of the feature.
macro_rules! sensor_function {
    (
        $index:literal,
        $(#[$req_meta:meta])*
        $request:ident = $request_schema:ident ($request_format:ident, $request_report:ident) {
            $($req_field:ident: $req_ty:ty),* $(,)?
        },
        $response:ident = $response_schema:ident ($response_format:ident) {
            $($rsp_field:ident: $rsp_ty:ty),* $(,)?
        }
    ) => {
        hidpp_message! {
            $(#[$req_meta])*
            pub struct $request = $request_schema {
                fields: $request_format,
                report: $request_report,
                kind: Request,
                feature: FEATURE_ID,
                index: $index,
                versions: [0],
            } {
                $($req_field: $req_ty),*
            }
        }

        hidpp_message! {
            pub struct $response = $response_schema {
                fields: $response_format,
                report: Long,
                kind: Response,
                feature: FEATURE_ID,
                index: $index,
                versions: [0],
            } {
                $($rsp_field: $rsp_ty),*
            }
        }

        impl Request for $request {
            type Response = $response;
        }
    };
}

sensor_function! {
    0,
    /// Reads a register of one of the sensors.
    ReadSensorRegister = READ_SENSOR_REGISTER (READ_SENSOR_REGISTER_FORMAT, Short) {
        sensor_id: u8,
        reg_addr: u8,
    },
    ReadSensorRegisterResponse = READ_SENSOR_REGISTER_RESPONSE (READ_WRITE_SENSOR_FORMAT) {
        sensor_id: u8,
        reg_addr: u8,
        reg_value: u16,
    }
}

sensor_function! {
    1,
    /// Writes a register of one of the sensors.
    WriteSensorRegister = WRITE_SENSOR_REGISTER (READ_WRITE_SENSOR_FORMAT, Long) {
        sensor_id: u8,
        reg_addr: u8,
        reg_value: u16,
    },
    WriteSensorRegisterResponse = WRITE_SENSOR_REGISTER_RESPONSE (READ_WRITE_SENSOR_FORMAT) {
        sensor_id: u8,
        reg_addr: u8,
        reg_value: u16,
    }
}

sensor_function! {
    2,
    /// Resets one of the sensors.
    ResetSensor = RESET_SENSOR (SENSOR_REQUEST_FORMAT, Short) {
        sensor_id: u8,
    },
    ResetSensorResponse = RESET_SENSOR_RESPONSE (SENSOR_RESPONSE_FORMAT) {
        sensor_id: u8,
    }
}

sensor_function! {
    3,
    /// Shuts one of the sensors down.
    ShutdownSensor = SHUTDOWN_SENSOR (SENSOR_REQUEST_FORMAT, Short) {
        sensor_id: u8,
    },
    ShutdownSensorResponse = SHUTDOWN_SENSOR_RESPONSE (SENSOR_RESPONSE_FORMAT) {
        sensor_id: u8,
    }
}

sensor_function! {
    4,
    /// Starts streaming monitor reports of a sensor. The device sends `count`
    /// reports, only considering changes above `threshold`.
    MonitorTest = MONITOR_TEST (MONITOR_TEST_FORMAT, Long) {
        sensor_id: u8,
        count: u16,
        threshold: u8,
    },
    MonitorTestResponse = MONITOR_TEST_RESPONSE (MONITOR_TEST_FORMAT) {
        sensor_id: u8,
        count: u16,
        threshold: u8,
    }
}

sensor_function! {
    5,
    /// Starts the calibration of a sensor.
    StartCalibration = START_CALIBRATION (SENSOR_REQUEST_FORMAT, Short) {
        sensor_id: u8,
    },
    StartCalibrationResponse = START_CALIBRATION_RESPONSE (SENSOR_RESPONSE_FORMAT) {
        sensor_id: u8,
    }
}

sensor_function! {
    6,
    /// Stops the calibration of a sensor and returns the result.
    StopCalibration = STOP_CALIBRATION (SENSOR_REQUEST_FORMAT, Short) {
        sensor_id: u8,
    },
    StopCalibrationResponse = STOP_CALIBRATION_RESPONSE (CALIBRATION_DATA_FORMAT) {
        sensor_id: u8,
        calibration_data: u32,
    }
}

sensor_function! {
    7,
    /// Reads the stored calibration of a sensor.
    ReadCalibration = READ_CALIBRATION (SENSOR_REQUEST_FORMAT, Short) {
        sensor_id: u8,
    },
    ReadCalibrationResponse = READ_CALIBRATION_RESPONSE (CALIBRATION_DATA_FORMAT) {
        sensor_id: u8,
        calibration_data: u32,
    }
}

sensor_function! {
    8,
    /// Stores a calibration for a sensor.
    WriteCalibration = WRITE_CALIBRATION (CALIBRATION_DATA_FORMAT, Long) {
        sensor_id: u8,
        calibration_data: u32,
    },
    WriteCalibrationResponse = WRITE_CALIBRATION_RESPONSE (CALIBRATION_DATA_FORMAT) {
        sensor_id: u8,
        calibration_data: u32,
    }
}

sensor_function! {
    9,
    /// Calibrates a sensor against a reference point.
    Calibrate = CALIBRATE (CALIBRATE_FORMAT, Short) {
        sensor_id: u8,
        ref_point_id: u8,
        ref_point_out_value: u8,
    },
    CalibrateResponse = CALIBRATE_RESPONSE (CALIBRATE_RESPONSE_FORMAT) {}
}

sensor_function! {
    10,
    /// Reads (`command = 0`) or writes (`command = 1`) the dynamic
    /// calibration parameters of one of the two sensors.
    ManageDynCallParam = MANAGE_DYN_CALL_PARAM (MANAGE_DYN_CALL_PARAM_FORMAT, Long) {
        command: u8,
        sensor_id: u8,
        parameters: [u8; 6],
    },
    ManageDynCallParamResponse = MANAGE_DYN_CALL_PARAM_RESPONSE (MANAGE_DYN_CALL_PARAM_FORMAT) {
        command: u8,
        sensor_id: u8,
        parameters: [u8; 6],
    }
}

hidpp_message! {
    /// A sample of a sensor streamed after [`MonitorTest`].
    pub struct MonitorReportEvent = MONITOR_REPORT_EVENT {
        fields: MONITOR_REPORT_FORMAT,
        report: Long,
        kind: Event,
        feature: FEATURE_ID,
        index: 0,
        versions: [0],
    } {
        sensor_id: u8,
        axis_x: u16,
        axis_y: u16,
        axis_z: u16,
        temperature: u16,
        arc_tangent: u16,
        counter: u16,
    }
}

/// The versions of the MLX90393 multi-sensor feature.
pub static MODEL: FeatureModel = FeatureModel {
    feature_id: FEATURE_ID,
    name: "Mlx90393MultiSensor",
    versions: &[VersionApi {
        version: 0,
        functions: &[
            FunctionApi {
                index: 0,
                name: "readSensorRegister",
                request: &READ_SENSOR_REGISTER,
                response: &READ_SENSOR_REGISTER_RESPONSE,
            },
            FunctionApi {
                index: 1,
                name: "writeSensorRegister",
                request: &WRITE_SENSOR_REGISTER,
                response: &WRITE_SENSOR_REGISTER_RESPONSE,
            },
            FunctionApi {
                index: 2,
                name: "resetSensor",
                request: &RESET_SENSOR,
                response: &RESET_SENSOR_RESPONSE,
            },
            FunctionApi {
                index: 3,
                name: "shutdownSensor",
                request: &SHUTDOWN_SENSOR,
                response: &SHUTDOWN_SENSOR_RESPONSE,
            },
            FunctionApi {
                index: 4,
                name: "monitorTest",
                request: &MONITOR_TEST,
                response: &MONITOR_TEST_RESPONSE,
            },
            FunctionApi {
                index: 5,
                name: "startCalibration",
                request: &START_CALIBRATION,
                response: &START_CALIBRATION_RESPONSE,
            },
            FunctionApi {
                index: 6,
                name: "stopCalibration",
                request: &STOP_CALIBRATION,
                response: &STOP_CALIBRATION_RESPONSE,
            },
            FunctionApi {
                index: 7,
                name: "readCalibration",
                request: &READ_CALIBRATION,
                response: &READ_CALIBRATION_RESPONSE,
            },
            FunctionApi {
                index: 8,
                name: "writeCalibration",
                request: &WRITE_CALIBRATION,
                response: &WRITE_CALIBRATION_RESPONSE,
            },
            FunctionApi {
                index: 9,
                name: "calibrate",
                request: &CALIBRATE,
                response: &CALIBRATE_RESPONSE,
            },
            FunctionApi {
                index: 10,
                name: "manageDynCallParam",
                request: &MANAGE_DYN_CALL_PARAM,
                response: &MANAGE_DYN_CALL_PARAM_RESPONSE,
            },
        ],
        events: &[EventApi {
            index: 0,
            name: "monitorReport",
            report: &MONITOR_REPORT_EVENT,
        }],
    }],
};

/// Implements the `Mlx90393MultiSensor` / `0x9209` feature.
#[derive(Clone)]
pub struct Mlx90393MultiSensorFeature {
    /// The underlying HID++ channel.
    chan: Arc<UsbChannel>,

    /// The index of the device to implement the feature for.
    device_index: u8,

    /// The index of the feature in the feature table.
    feature_index: u8,
}

impl CreatableFeature for Mlx90393MultiSensorFeature {
    const ID: u16 = FEATURE_ID;
    const STARTING_VERSION: u8 = 0;

    fn new(chan: Arc<UsbChannel>, device_index: u8, feature_index: u8) -> Self {
        Self {
            chan,
            device_index,
            feature_index,
        }
    }
}

impl Feature for Mlx90393MultiSensorFeature {
    fn id(&self) -> u16 {
        FEATURE_ID
    }
}

impl Mlx90393MultiSensorFeature {
    /// Reads a 16 bits register of a sensor.
    pub fn read_sensor_register(&self, sensor_id: u8, reg_addr: u8) -> Result<u16, ChannelError> {
        let response = self.chan.send(ReadSensorRegister::new(
            self.device_index,
            self.feature_index,
            sensor_id,
            reg_addr,
        ))?;

        Ok(response.reg_value)
    }

    /// Writes a 16 bits register of a sensor.
    pub fn write_sensor_register(
        &self,
        sensor_id: u8,
        reg_addr: u8,
        reg_value: u16,
    ) -> Result<WriteSensorRegisterResponse, ChannelError> {
        self.chan.send(WriteSensorRegister::new(
            self.device_index,
            self.feature_index,
            sensor_id,
            reg_addr,
            reg_value,
        ))
    }

    pub fn reset_sensor(&self, sensor_id: u8) -> Result<(), ChannelError> {
        self.chan.send(ResetSensor::new(
            self.device_index,
            self.feature_index,
            sensor_id,
        ))?;
        Ok(())
    }

    pub fn shutdown_sensor(&self, sensor_id: u8) -> Result<(), ChannelError> {
        self.chan.send(ShutdownSensor::new(
            self.device_index,
            self.feature_index,
            sensor_id,
        ))?;
        Ok(())
    }

    /// Starts a monitor test. The samples arrive as [`MonitorReportEvent`]s,
    /// see [`Self::next_monitor_report`].
    pub fn monitor_test(
        &self,
        sensor_id: u8,
        count: u16,
        threshold: u8,
    ) -> Result<MonitorTestResponse, ChannelError> {
        self.chan.send(MonitorTest::new(
            self.device_index,
            self.feature_index,
            sensor_id,
            count,
            threshold,
        ))
    }

    pub fn start_calibration(&self, sensor_id: u8) -> Result<(), ChannelError> {
        self.chan.send(StartCalibration::new(
            self.device_index,
            self.feature_index,
            sensor_id,
        ))?;
        Ok(())
    }

    /// Stops the calibration and returns the calibration data.
    pub fn stop_calibration(&self, sensor_id: u8) -> Result<u32, ChannelError> {
        let response = self.chan.send(StopCalibration::new(
            self.device_index,
            self.feature_index,
            sensor_id,
        ))?;

        Ok(response.calibration_data)
    }

    pub fn read_calibration(&self, sensor_id: u8) -> Result<u32, ChannelError> {
        let response = self.chan.send(ReadCalibration::new(
            self.device_index,
            self.feature_index,
            sensor_id,
        ))?;

        Ok(response.calibration_data)
    }

    /// Stores calibration data and returns what the device echoed.
    pub fn write_calibration(&self, sensor_id: u8, calibration_data: u32) -> Result<u32, ChannelError> {
        let response = self.chan.send(WriteCalibration::new(
            self.device_index,
            self.feature_index,
            sensor_id,
            calibration_data,
        ))?;

        Ok(response.calibration_data)
    }

    pub fn calibrate(
        &self,
        sensor_id: u8,
        ref_point_id: u8,
        ref_point_out_value: u8,
    ) -> Result<(), ChannelError> {
        self.chan.send(Calibrate::new(
            self.device_index,
            self.feature_index,
            sensor_id,
            ref_point_id,
            ref_point_out_value,
        ))?;
        Ok(())
    }

    pub fn manage_dyn_call_param(
        &self,
        command: u8,
        sensor_id: u8,
        parameters: [u8; 6],
    ) -> Result<ManageDynCallParamResponse, ChannelError> {
        self.chan.send(ManageDynCallParam::new(
            self.device_index,
            self.feature_index,
            command,
            sensor_id,
            parameters,
        ))
    }

    /// Waits for the next monitor report of this device.
    pub fn next_monitor_report(&self, timeout: Duration) -> Result<MonitorReportEvent, ChannelError> {
        self.chan
            .wait_event::<MonitorReportEvent>(self.device_index, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        nibble::U4,
        schema::{CodecError, TypedMessage},
    };

    #[test]
    fn read_sensor_register_request() {
        let mut request = ReadSensorRegister::new(0x01, 0x07, 0x02, 0x0a);
        request.header.software_id = U4::from_lo(0x3);

        assert_eq!(
            request.encode().unwrap(),
            [0x10, 0x01, 0x07, 0x03, 0x02, 0x0a, 0x00]
        );
    }

    #[test]
    fn manage_dyn_call_param_packs_bits() {
        let request = ManageDynCallParam::new(0x01, 0x07, 1, 1, [1, 2, 3, 4, 5, 6]);
        let bytes = request.encode().unwrap();

        assert_eq!(&bytes[..11], [0x11, 0x01, 0x07, 0xa0, 0xc0, 1, 2, 3, 4, 5, 6]);
        assert!(bytes[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn manage_dyn_call_param_rejects_wide_command() {
        let request = ManageDynCallParam::new(0x01, 0x07, 2, 0, [0; 6]);

        assert!(matches!(
            request.encode(),
            Err(CodecError::FieldRange { field: "command", .. })
        ));
    }

    #[test]
    fn monitor_report_is_an_event() {
        let mut frame = [0u8; 20];
        frame[..20].copy_from_slice(&[
            0x11, 0x01, 0x07, 0x00, 0x01, 0x00, 0x10, 0xff, 0xf0, 0x12, 0x34, 0x0b, 0xb8, 0x80,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x2a,
        ]);

        let event = MonitorReportEvent::decode(&frame).unwrap();

        assert_eq!(event.sensor_id, 0x01);
        assert_eq!(event.axis_x, 0x0010);
        assert_eq!(event.axis_y, 0xfff0);
        assert_eq!(event.axis_z, 0x1234);
        assert_eq!(event.temperature, 0x0bb8);
        assert_eq!(event.arc_tangent, 0x8000);
        assert_eq!(event.counter, 0x002a);
        assert_eq!(event.header.software_id, U4::from_lo(0));
    }

    #[test]
    fn functions_share_formats() {
        let facade = MODEL.create(0).unwrap();

        assert!(std::ptr::eq(
            facade.request(1).unwrap().fields,
            facade.response(0).unwrap().fields
        ));
        assert_eq!(facade.functions().len(), 11);
        assert_eq!(facade.event(0).unwrap().name, "MonitorReportEvent");
    }
}
