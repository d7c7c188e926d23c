//! Feature availability per hardware family, decided once from the serial number.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    Energy,
    Solar,
    ProPlus,
    Genius,
    WifiConnect,
    EthernetConnect,
    CellularConnect,
    P1S1,
    Unknown,
    Deactivated,
}

impl DeviceFamily {
    pub fn from_serial(serial: Option<&str>) -> Self {
        let Some(serial) = serial else {
            return DeviceFamily::Deactivated;
        };
        let by_two = match serial.get(..2) {
            Some("10") => Some(DeviceFamily::Energy),
            Some("11") => Some(DeviceFamily::Solar),
            Some("20") => Some(DeviceFamily::ProPlus),
            Some("50") => Some(DeviceFamily::Genius),
            Some("57") => Some(DeviceFamily::P1S1),
            _ => None,
        };
        if let Some(family) = by_two {
            return family;
        }
        match serial.get(..4) {
            Some("5100") | Some("5110") => DeviceFamily::WifiConnect,
            Some("5130") => DeviceFamily::EthernetConnect,
            Some("5140") => DeviceFamily::CellularConnect,
            _ => DeviceFamily::Unknown,
        }
    }

    pub fn model_name(self) -> &'static str {
        match self {
            DeviceFamily::Energy => "Smappee Energy",
            DeviceFamily::Solar => "Smappee Solar",
            DeviceFamily::ProPlus => "Smappee Pro/Plus",
            DeviceFamily::Genius => "Smappee Genius",
            DeviceFamily::WifiConnect => "Smappee Wi-Fi Connect",
            DeviceFamily::EthernetConnect => "Smappee Ethernet Connect",
            DeviceFamily::CellularConnect => "Smappee 4G Connect",
            DeviceFamily::P1S1 => "Smappee P1S1 module",
            DeviceFamily::Unknown => "Smappee",
            DeviceFamily::Deactivated => "Smappee deactivated",
        }
    }

    fn is_connect(self) -> bool {
        matches!(
            self,
            DeviceFamily::WifiConnect | DeviceFamily::EthernetConnect | DeviceFamily::CellularConnect
        )
    }
}

/// What a location's primary device can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub family: DeviceFamily,
    /// Solar production known from hardware alone; configuration may add it too
    pub solar_production: bool,
    pub voltage_values: bool,
    /// An in-network broker with extra fields is reachable
    pub local_telemetry: bool,
    pub reactive_power: bool,
}

impl DeviceCapabilities {
    pub fn from_serial(serial: Option<&str>) -> Self {
        let family = DeviceFamily::from_serial(serial);
        let local_telemetry = matches!(family, DeviceFamily::ProPlus | DeviceFamily::Genius);
        Self {
            family,
            solar_production: family == DeviceFamily::Solar,
            voltage_values: family == DeviceFamily::Genius || family.is_connect(),
            local_telemetry,
            reactive_power: local_telemetry,
        }
    }

    pub fn model_name(&self) -> &'static str {
        self.family.model_name()
    }
}
