//! SD SPI-mode protocol constants.

/* Commands */
pub const CMD0: u8 = 0; /* GO_IDLE_STATE */
pub const CMD8: u8 = 8; /* SEND_IF_COND */
pub const CMD9: u8 = 9; /* SEND_CSD */
pub const CMD12: u8 = 12; /* STOP_TRANSMISSION */
pub const CMD13: u8 = 13; /* SEND_STATUS */
pub const CMD16: u8 = 16; /* SET_BLOCKLEN */
pub const CMD17: u8 = 17; /* READ_SINGLE_BLOCK */
pub const CMD18: u8 = 18; /* READ_MULTIPLE_BLOCK */
pub const CMD24: u8 = 24; /* WRITE_BLOCK */
pub const CMD25: u8 = 25; /* WRITE_MULTIPLE_BLOCK */
pub const CMD32: u8 = 32; /* ERASE_WR_BLK_START_ADDR */
pub const CMD33: u8 = 33; /* ERASE_WR_BLK_END_ADDR */
pub const CMD38: u8 = 38; /* ERASE */
pub const CMD55: u8 = 55; /* APP_CMD */
pub const CMD58: u8 = 58; /* READ_OCR */
pub const CMD59: u8 = 59; /* CRC_ON_OFF */
pub const ACMD22: u8 = 22; /* SEND_NUM_WR_BLOCKS */
pub const ACMD23: u8 = 23; /* SET_WR_BLK_ERASE_COUNT */
pub const ACMD41: u8 = 41; /* SD_SEND_OP_COND */

/* R1 response bits */
pub const R1_NO_RESPONSE: u8 = 0xFF;
pub const R1_RESPONSE_RECV: u8 = 0x80;
pub const R1_READY_STATE: u8 = 0x00;
pub const R1_IDLE_STATE: u8 = 1 << 0;
pub const R1_ERASE_RESET: u8 = 1 << 1;
pub const R1_ILLEGAL_COMMAND: u8 = 1 << 2;
pub const R1_COM_CRC_ERROR: u8 = 1 << 3;
pub const R1_ERASE_SEQUENCE_ERROR: u8 = 1 << 4;
pub const R1_ADDRESS_ERROR: u8 = 1 << 5;
pub const R1_PARAMETER_ERROR: u8 = 1 << 6;

/* Control tokens */
pub const DATA_START_BLOCK: u8 = 0xFE;
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;
pub const STOP_TRAN_TOKEN: u8 = 0xFD;
pub const DATA_RES_MASK: u8 = 0x1F;
pub const DATA_RES_ACCEPTED: u8 = 0x05;
pub const DATA_RES_CRC_ERROR: u8 = 0x0B;
pub const DATA_RES_WRITE_ERROR: u8 = 0x0D;

/* OCR register bits (CMD58 payload) */
pub const OCR_CCS: u32 = 1 << 30;
pub const OCR_3_3V: u32 = 1 << 20;

/* CMD8 argument: 2.7-3.6 V range plus check pattern 0xAA */
pub const CMD8_ARG: u32 = 0x1AA;
/* ACMD41 host-capacity-support flag */
pub const ACMD41_HCS: u32 = 1 << 30;

/* Fixed command CRCs used while CRC is globally off */
pub const CMD0_CRC: u8 = 0x95;
pub const CMD8_CRC: u8 = 0x87;
/* End bit alone, the card ignores the CRC field */
pub const CRC_FILLER: u8 = 0x01;

pub const BLOCK_SIZE: u32 = 512;

/* Clock limits. Cards must accept 400 kHz during identification and
 * 25 MHz in SPI transfer mode. */
pub const MAX_INIT_FREQUENCY: u32 = 400_000;
pub const MAX_TRANSFER_FREQUENCY: u32 = 25_000_000;
pub const DEFAULT_INIT_FREQUENCY: u32 = 200_000;
pub const DEFAULT_TRANSFER_FREQUENCY: u32 = 20_000_000;

/* Bounded waits. Ready polls step 10 us apiece, 300 ms total. The
 * ACMD41 loop steps 1 ms apiece, giving the card over a second to
 * finish powering up. */
pub const READY_POLLS: u32 = 30_000;
pub const READY_POLL_DELAY_US: u32 = 10;
pub const TOKEN_POLLS: u32 = 50_000;
pub const R1_POLLS: u32 = 16;
pub const CMD_RETRIES: u32 = 3;
pub const CMD0_ATTEMPTS: u32 = 10;
pub const OP_COND_ATTEMPTS: u32 = 1_000;
pub const OP_COND_DELAY_US: u32 = 1_000;

/* >= 74 dummy clocks with CS deasserted before the first command */
pub const DUMMY_CLOCK_BYTES: u32 = 20;
