//! Low-level byte reading and value-descriptor/instruction decoding.
//! Nothing here touches the heap — it only turns bytes into the
//! plain data [`crate::loader::mod@super`] installs into the value graph.

use smallvec::SmallVec;

use crate::bytecode::{Instruction, Literal, Opcode, Operand, RegId};
use crate::error::LoaderError;
use crate::intern::Interner;
use crate::reference::{RefEntry, Reference};
use crate::types::{Type, TypePayload, TypeRef, TypeTag};

/// A cursor over an in-memory module image.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LoaderError> {
        let end = self.pos.checked_add(n).ok_or(LoaderError::PrematureEof)?;
        let slice = self.data.get(self.pos..end).ok_or(LoaderError::PrematureEof)?;
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, LoaderError> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8, LoaderError> {
        Ok(self.u8()? as i8)
    }

    pub fn u16(&mut self) -> Result<u16, LoaderError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn i16(&mut self) -> Result<i16, LoaderError> {
        Ok(self.u16()? as i16)
    }

    pub fn u32(&mut self) -> Result<u32, LoaderError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn i32(&mut self) -> Result<i32, LoaderError> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64, LoaderError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Result<i64, LoaderError> {
        Ok(self.u64()? as i64)
    }

    pub fn f32(&mut self) -> Result<f32, LoaderError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn f64(&mut self) -> Result<f64, LoaderError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], LoaderError> {
        self.take(n)
    }

    pub fn string(&mut self) -> Result<String, LoaderError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

fn tag_at(byte: u8) -> Result<TypeTag, LoaderError> {
    TypeTag::from_repr(byte).ok_or(LoaderError::UnknownTag(u32::from(byte)))
}

/// Decodes a type name: the composite forms recurse,
/// defining tags decode to a deferred reference resolved lazily at first use.
pub fn read_type(r: &mut Reader<'_>, interns: &mut Interner) -> Result<Type, LoaderError> {
    let tag = tag_at(r.u8()?)?;
    let is_const = r.u8()? != 0;
    let payload = match tag {
        TypeTag::Array => TypePayload::Array(Box::new(read_type(r, interns)?)),
        TypeTag::Map => {
            let k = read_type(r, interns)?;
            let v = read_type(r, interns)?;
            TypePayload::Map(Box::new(k), Box::new(v))
        }
        TypeTag::Class | TypeTag::Interface | TypeTag::Trait | TypeTag::Object => {
            TypePayload::Defining(TypeRef::Deferred(read_reference(r, interns)?))
        }
        TypeTag::GenericArg => TypePayload::GenericArg(r.u8()?),
        _ => TypePayload::None,
    };
    Ok(Type { tag, payload, is_const })
}

/// Decodes a reference chain: entries until the continuation bit is
/// clear, each carrying a name and any generic arguments.
pub fn read_reference(r: &mut Reader<'_>, interns: &mut Interner) -> Result<Reference, LoaderError> {
    let mut entries = Vec::new();
    loop {
        let flags = r.u8()?;
        let continues = flags & 0x01 != 0;
        let name = r.string()?;
        let generic_count = r.u8()? as usize;
        let mut generic_args = Vec::with_capacity(generic_count);
        for _ in 0..generic_count {
            generic_args.push(read_type(r, interns)?);
        }
        entries.push(RefEntry { name: interns.intern(&name), generic_args });
        if !continues {
            break;
        }
    }
    Ok(Reference { entries })
}

/// Decodes one instruction operand: a tag byte
/// plus a tag-dependent payload, reusing the same tag space as type
/// encoding.
pub fn read_operand(r: &mut Reader<'_>, interns: &mut Interner) -> Result<Operand, LoaderError> {
    let tag = tag_at(r.u8()?)?;
    let operand = match tag {
        TypeTag::None => Operand::Literal(Literal::None),
        TypeTag::I8 => Operand::Literal(Literal::I8(r.i8()?)),
        TypeTag::I16 => Operand::Literal(Literal::I16(r.i16()?)),
        TypeTag::I32 => Operand::Literal(Literal::I32(r.i32()?)),
        TypeTag::I64 => Operand::Literal(Literal::I64(r.i64()?)),
        TypeTag::U8 => Operand::Literal(Literal::U8(r.u8()?)),
        TypeTag::U16 => Operand::Literal(Literal::U16(r.u16()?)),
        TypeTag::U32 => Operand::Literal(Literal::U32(r.u32()?)),
        TypeTag::U64 => Operand::Literal(Literal::U64(r.u64()?)),
        TypeTag::F32 => Operand::Literal(Literal::F32(r.f32()?)),
        TypeTag::F64 => Operand::Literal(Literal::F64(r.f64()?)),
        TypeTag::Bool => Operand::Literal(Literal::Bool(r.u8()? != 0)),
        TypeTag::String => Operand::Literal(Literal::Str(r.string()?)),
        TypeTag::WString => {
            let len = r.u32()? as usize;
            let mut units = Vec::with_capacity(len);
            for _ in 0..len {
                units.push(r.u16()?);
            }
            Operand::Literal(Literal::WStr(units))
        }
        TypeTag::Char => Operand::Literal(Literal::Char(char::from_u32(r.u32()?).unwrap_or('\u{FFFD}'))),
        TypeTag::WChar => Operand::Literal(Literal::WChar(r.u16()?)),
        TypeTag::Ref => Operand::Reference(read_reference(r, interns)?),
        TypeTag::Typename => Operand::TypeName(read_type(r, interns)?),
        TypeTag::RegRef => {
            let id = reg_from_u8(r.u8()?)?;
            let deref = r.u8()? != 0;
            Operand::Reg { id, deref }
        }
        TypeTag::LvarRef => {
            let index = r.u16()?;
            let deref = r.u8()? != 0;
            Operand::Local { index, deref }
        }
        TypeTag::ArgRef => {
            let index = r.u16()?;
            let deref = r.u8()? != 0;
            Operand::Arg { index, deref }
        }
        other => return Err(LoaderError::UnknownTag(other as u32)),
    };
    Ok(operand)
}

fn reg_from_u8(byte: u8) -> Result<RegId, LoaderError> {
    Ok(match byte {
        0 => RegId::Tmp0,
        1 => RegId::Tmp1,
        2 => RegId::R0,
        3 => RegId::R1,
        4 => RegId::R2,
        5 => RegId::R3,
        6 => RegId::Rr,
        7 => RegId::Rthis,
        8 => RegId::Rxcpt,
        other => return Err(LoaderError::UnknownTag(u32::from(other))),
    })
}

/// Decodes one literal value prefixed by its own tag byte, for use inside a
/// `CONSTSW` switch table arm.
fn read_literal(r: &mut Reader<'_>) -> Result<Literal, LoaderError> {
    let tag = tag_at(r.u8()?)?;
    Ok(match tag {
        TypeTag::None => Literal::None,
        TypeTag::I8 => Literal::I8(r.i8()?),
        TypeTag::I16 => Literal::I16(r.i16()?),
        TypeTag::I32 => Literal::I32(r.i32()?),
        TypeTag::I64 => Literal::I64(r.i64()?),
        TypeTag::U8 => Literal::U8(r.u8()?),
        TypeTag::U16 => Literal::U16(r.u16()?),
        TypeTag::U32 => Literal::U32(r.u32()?),
        TypeTag::U64 => Literal::U64(r.u64()?),
        TypeTag::Bool => Literal::Bool(r.u8()? != 0),
        TypeTag::String => Literal::Str(r.string()?),
        other => return Err(LoaderError::UnknownTag(other as u32)),
    })
}

/// Decodes one packed instruction header plus its operands.
///
/// `JMP`/`JT`/`JF`/`PUSHXH` take a single absolute instruction-offset label
/// rather than a tagged operand, and `CONSTSW` takes an arm count followed
/// by `(literal, label)` pairs — both are framed outside the generic
/// operand tag space because the loader resolves them to offsets within the
/// enclosing function body rather than leaving them as runtime-polymorphic
/// values.
pub fn read_instruction(r: &mut Reader<'_>, interns: &mut Interner) -> Result<Instruction, LoaderError> {
    let header = r.u16()?;
    let opcode_num = header & 0x3FFF;
    let operand_count = (header >> 14) & 0x3;
    let opcode = Opcode::from_repr(opcode_num).ok_or(LoaderError::UnknownTag(u32::from(opcode_num)))?;

    let mut operands: SmallVec<[Operand; 3]> = SmallVec::new();
    match opcode {
        Opcode::Jmp | Opcode::Jt | Opcode::Jf | Opcode::Pushxh => {
            for _ in 0..operand_count {
                operands.push(Operand::Label(r.u32()?));
            }
        }
        Opcode::Constsw => {
            let arm_count = r.u16()? as usize;
            let mut arms = Vec::with_capacity(arm_count);
            for _ in 0..arm_count {
                let value = read_literal(r)?;
                let target = r.u32()?;
                arms.push((value, target));
            }
            operands.push(Operand::SwitchTable(arms));
        }
        _ => {
            for _ in 0..operand_count {
                operands.push(read_operand(r, interns)?);
            }
        }
    }
    Ok(Instruction { opcode, operands })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn reader_reads_little_endian_primitives() {
        let bytes = [0x2A, 0, 0x34, 0x12, 0, 0, 0, 0, 0, 0, 0, 0, 0xC0];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.u16().unwrap(), 0x2A);
        assert_eq!(r.u32().unwrap(), 0x1234);
        assert_eq!(r.u8().unwrap(), 0);
        assert_eq!(r.u8().unwrap(), 0);
        assert_eq!(r.u8().unwrap(), 0);
        assert_eq!(r.u8().unwrap(), 0);
        assert_eq!(r.u8().unwrap(), 0);
        assert_eq!(r.u8().unwrap(), 0xC0);
    }

    #[test]
    fn reader_reports_premature_eof_rather_than_panicking() {
        let bytes = [0x01];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.u32(), Err(LoaderError::PrematureEof));
    }

    #[test]
    fn read_type_decodes_a_simple_tag() {
        let bytes = [TypeTag::I32 as u8, 0];
        let mut interns = Interner::new();
        let ty = read_type(&mut Reader::new(&bytes), &mut interns).unwrap();
        assert_eq!(ty, Type::simple(TypeTag::I32));
    }

    #[test]
    fn read_type_decodes_an_array_of_bool() {
        let bytes = [TypeTag::Array as u8, 0, TypeTag::Bool as u8, 0];
        let mut interns = Interner::new();
        let ty = read_type(&mut Reader::new(&bytes), &mut interns).unwrap();
        assert_eq!(ty, Type::array(Type::simple(TypeTag::Bool)));
    }

    #[test]
    fn read_type_decodes_a_deferred_class_reference() {
        let mut bytes = vec![TypeTag::Class as u8, 0];
        bytes.push(0); // reference flags: no continuation
        push_string(&mut bytes, "Widget");
        bytes.push(0); // no generic args
        let mut interns = Interner::new();
        let ty = read_type(&mut Reader::new(&bytes), &mut interns).unwrap();
        assert_eq!(ty.tag, TypeTag::Class);
        let TypePayload::Defining(TypeRef::Deferred(r)) = ty.payload else { panic!("expected a deferred reference") };
        assert_eq!(interns.resolve(r.entries[0].name), "Widget");
    }

    #[test]
    fn read_reference_decodes_a_dotted_chain_with_trailing_generic_args() {
        let mut bytes = Vec::new();
        bytes.push(0x01); // "Outer" continues
        push_string(&mut bytes, "Outer");
        bytes.push(0); // no generics on "Outer"
        bytes.push(0x00); // "Inner" is the last entry
        push_string(&mut bytes, "Inner");
        bytes.push(1); // one generic argument
        bytes.push(TypeTag::I32 as u8);
        bytes.push(0);

        let mut interns = Interner::new();
        let reference = read_reference(&mut Reader::new(&bytes), &mut interns).unwrap();
        assert_eq!(reference.entries.len(), 2);
        assert_eq!(interns.resolve(reference.entries[0].name), "Outer");
        assert!(reference.entries[0].generic_args.is_empty());
        assert_eq!(interns.resolve(reference.entries[1].name), "Inner");
        assert_eq!(reference.entries[1].generic_args, vec![Type::simple(TypeTag::I32)]);
    }

    #[test]
    fn read_operand_decodes_register_local_and_arg_forms() {
        let mut interns = Interner::new();

        let reg_bytes = [TypeTag::RegRef as u8, 2, 1]; // R0, deref=true
        let reg = read_operand(&mut Reader::new(&reg_bytes), &mut interns).unwrap();
        assert!(matches!(reg, Operand::Reg { id: RegId::R0, deref: true }));

        let local_bytes = [TypeTag::LvarRef as u8, 5, 0, 0]; // index=5, deref=false
        let local = read_operand(&mut Reader::new(&local_bytes), &mut interns).unwrap();
        assert!(matches!(local, Operand::Local { index: 5, deref: false }));

        let arg_bytes = [TypeTag::ArgRef as u8, 1, 0, 1]; // index=1, deref=true
        let arg = read_operand(&mut Reader::new(&arg_bytes), &mut interns).unwrap();
        assert!(matches!(arg, Operand::Arg { index: 1, deref: true }));
    }

    #[test]
    fn read_operand_rejects_an_unknown_tag() {
        let bytes = [200u8];
        let mut interns = Interner::new();
        let err = read_operand(&mut Reader::new(&bytes), &mut interns).unwrap_err();
        assert_eq!(err, LoaderError::UnknownTag(200));
    }

    #[test]
    fn read_instruction_decodes_a_packed_header_with_three_register_operands() {
        let header: u16 = (Opcode::Add as u16) | (3 << 14);
        let mut bytes = header.to_le_bytes().to_vec();
        for reg in [0u8, 1, 2] {
            bytes.push(TypeTag::RegRef as u8);
            bytes.push(reg);
            bytes.push(0);
        }
        let mut interns = Interner::new();
        let instr = read_instruction(&mut Reader::new(&bytes), &mut interns).unwrap();
        assert_eq!(instr.opcode, Opcode::Add);
        assert_eq!(instr.operands.len(), 3);
    }

    #[test]
    fn read_instruction_decodes_a_jmp_label_outside_the_operand_tag_space() {
        let header: u16 = (Opcode::Jmp as u16) | (1 << 14);
        let mut bytes = header.to_le_bytes().to_vec();
        bytes.extend_from_slice(&42u32.to_le_bytes());
        let mut interns = Interner::new();
        let instr = read_instruction(&mut Reader::new(&bytes), &mut interns).unwrap();
        assert_eq!(instr.opcode, Opcode::Jmp);
        assert_eq!(instr.operands.len(), 1);
        assert!(matches!(instr.operands[0], Operand::Label(42)));
    }
}
