//! Decoding of type signatures into [`ClrType`] values.
//!
//! Signatures use the compact element-type grammar of the metadata format. Decoding is a
//! recursive descent over a [`Parser`]. Every branch consumes exactly the bytes its
//! grammar rule occupies, including on paths where the resulting type cannot be resolved,
//! so a caller decoding a field or local list stays aligned with the next entry.
//!
//! Internally each rule returns:
//! - `Ok(Some(type))` when the rule was decoded and the type resolved
//! - `Ok(None)` when the rule was fully consumed but no type could be materialized
//! - `Err(_)` when the blob ended or was malformed in a way that loses alignment

use tracing::trace;

use crate::{
    target::parser::Parser,
    typesystem::{
        ClrElementType, ClrTypeRc, GenericParameter, TypeFactory, ELEMENT_TYPE, SIG_GENERIC,
    },
    Error, Result,
};

/// Maximum nesting of signature elements before decoding gives up
pub const MAX_RECURSION_DEPTH: usize = 50;

impl TypeFactory {
    /// Decode one type from a signature blob.
    ///
    /// The parser is advanced past the decoded type. `None` means the type could not be
    /// materialized; when the blob itself was well formed the cursor still sits right
    /// after the element.
    ///
    /// ## Arguments
    /// * 'module'            - Module whose tokens the signature references
    /// * 'parser'            - Cursor positioned at the element-type byte
    /// * 'type_parameters'   - Generic parameters of the enclosing type, for `VAR`
    /// * 'method_parameters' - Generic parameters of the enclosing method, for `MVAR`
    pub fn get_or_create_type_from_signature(
        &self,
        module: u64,
        parser: &mut Parser,
        type_parameters: &[GenericParameter],
        method_parameters: &[GenericParameter],
    ) -> Option<ClrTypeRc> {
        let context = SignatureContext {
            module,
            type_parameters,
            method_parameters,
        };

        match self.decode_type(&context, parser, 0) {
            Ok(decoded) => decoded,
            Err(error) => {
                trace!(module, position = parser.pos(), %error, "signature decoding failed");
                None
            }
        }
    }

    fn decode_type(
        &self,
        context: &SignatureContext,
        parser: &mut Parser,
        depth: usize,
    ) -> Result<Option<ClrTypeRc>> {
        if depth >= MAX_RECURSION_DEPTH {
            return Err(Error::RecursionLimit(MAX_RECURSION_DEPTH));
        }

        let element = parser.read_le::<u8>()?;
        match element {
            ELEMENT_TYPE::VOID
            | ELEMENT_TYPE::BOOLEAN
            | ELEMENT_TYPE::CHAR
            | ELEMENT_TYPE::I1
            | ELEMENT_TYPE::U1
            | ELEMENT_TYPE::I2
            | ELEMENT_TYPE::U2
            | ELEMENT_TYPE::I4
            | ELEMENT_TYPE::U4
            | ELEMENT_TYPE::I8
            | ELEMENT_TYPE::U8
            | ELEMENT_TYPE::R4
            | ELEMENT_TYPE::R8
            | ELEMENT_TYPE::I
            | ELEMENT_TYPE::U
            | ELEMENT_TYPE::STRING
            | ELEMENT_TYPE::OBJECT => Ok(Some(
                self.get_or_create_basic_type(ClrElementType::from_code(u32::from(element))),
            )),
            ELEMENT_TYPE::TYPEDBYREF => Ok(None),
            ELEMENT_TYPE::CLASS | ELEMENT_TYPE::VALUETYPE => {
                let Some(token) = read_token(parser)? else {
                    return Ok(None);
                };

                let fallback = if element == ELEMENT_TYPE::VALUETYPE {
                    ClrElementType::Struct
                } else {
                    ClrElementType::Class
                };
                Ok(Some(
                    self.get_or_create_type_from_token(context.module, token)
                        .unwrap_or_else(|| self.get_or_create_basic_type(fallback)),
                ))
            }
            ELEMENT_TYPE::PTR | ELEMENT_TYPE::BYREF => {
                skip_custom_modifiers(parser)?;
                let inner = self.decode_type(context, parser, depth + 1)?;
                Ok(Some(self.wrap_pointer(inner)))
            }
            ELEMENT_TYPE::FNPTR => {
                self.skip_method_signature(context, parser, depth + 1)?;
                Ok(Some(self.wrap_pointer(None)))
            }
            ELEMENT_TYPE::SZARRAY => {
                skip_custom_modifiers(parser)?;
                let inner = self.decode_type(context, parser, depth + 1)?;
                Ok(Some(self.get_or_create_array_type(self.or_void(inner), 1)))
            }
            ELEMENT_TYPE::ARRAY => {
                let inner = self.decode_type(context, parser, depth + 1)?;
                let rank = parser.read_compressed_uint()?;

                let num_sizes = parser.read_compressed_uint()?;
                for _ in 0..num_sizes {
                    parser.read_compressed_uint()?;
                }

                let num_lo_bounds = parser.read_compressed_uint()?;
                for _ in 0..num_lo_bounds {
                    parser.read_compressed_int()?;
                }

                Ok(Some(self.get_or_create_array_type(self.or_void(inner), rank)))
            }
            ELEMENT_TYPE::GENERICINST => {
                // The instantiation kind byte, CLASS or VALUETYPE
                parser.read_le::<u8>()?;
                let token = read_token(parser)?;

                let count = parser.read_compressed_uint()?;
                for _ in 0..count {
                    self.decode_type(context, parser, depth + 1)?;
                }

                Ok(token.and_then(|token| self.get_or_create_type_from_token(context.module, token)))
            }
            ELEMENT_TYPE::VAR | ELEMENT_TYPE::MVAR => {
                let index = parser.read_compressed_uint()?;
                let is_method = element == ELEMENT_TYPE::MVAR;
                let parameters = if is_method {
                    context.method_parameters
                } else {
                    context.type_parameters
                };

                Ok(parameters.get(index as usize).map(|parameter| {
                    self.get_or_create_generic_parameter(
                        parameter.index,
                        is_method,
                        parameter.name.clone(),
                    )
                }))
            }
            ELEMENT_TYPE::CMOD_REQD | ELEMENT_TYPE::CMOD_OPT => {
                read_token(parser)?;
                self.decode_type(context, parser, depth + 1)
            }
            ELEMENT_TYPE::PINNED | ELEMENT_TYPE::SENTINEL => {
                self.decode_type(context, parser, depth + 1)
            }
            ELEMENT_TYPE::INTERNAL => {
                let method_table = if self.pointer_size() == 4 {
                    u64::from(parser.read_le::<u32>()?)
                } else {
                    parser.read_le::<u64>()?
                };
                Ok(self.get_or_create_type(method_table, 0))
            }
            _ => {
                trace!(element, "unsupported element type in signature");
                Ok(None)
            }
        }
    }

    /// Consume a method signature: calling convention, generic arity, parameter count,
    /// return type and parameters.
    fn skip_method_signature(
        &self,
        context: &SignatureContext,
        parser: &mut Parser,
        depth: usize,
    ) -> Result<()> {
        let calling_convention = parser.read_le::<u8>()?;
        if calling_convention & SIG_GENERIC != 0 {
            parser.read_compressed_uint()?;
        }

        let param_count = parser.read_compressed_uint()?;
        self.decode_type(context, parser, depth)?;
        for _ in 0..param_count {
            if parser.peek_byte()? == ELEMENT_TYPE::SENTINEL {
                parser.advance()?;
            }
            self.decode_type(context, parser, depth)?;
        }

        Ok(())
    }

    fn or_void(&self, inner: Option<ClrTypeRc>) -> ClrTypeRc {
        inner.unwrap_or_else(|| self.get_or_create_basic_type(ClrElementType::Void))
    }

    fn wrap_pointer(&self, inner: Option<ClrTypeRc>) -> ClrTypeRc {
        self.get_or_create_pointer_type(self.or_void(inner), 1)
    }
}

struct SignatureContext<'a> {
    module: u64,
    type_parameters: &'a [GenericParameter],
    method_parameters: &'a [GenericParameter],
}

/// Reads a TypeDefOrRef token. A reserved tag has still consumed its bytes and yields `None`.
/// An invalid lead byte consumes nothing, so the error is returned.
fn read_token(parser: &mut Parser) -> Result<Option<u32>> {
    let start = parser.pos();
    match parser.read_compressed_token() {
        Ok(token) => Ok(Some(token)),
        Err(Error::Malformed { .. }) if parser.pos() != start => Ok(None),
        Err(error) => Err(error),
    }
}

fn skip_custom_modifiers(parser: &mut Parser) -> Result<()> {
    while parser.has_more_data() {
        match parser.peek_byte()? {
            ELEMENT_TYPE::CMOD_REQD | ELEMENT_TYPE::CMOD_OPT => {
                parser.advance()?;
                read_token(parser)?;
            }
            _ => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::CacheOptions,
        dac::{CommonMethodTables, MethodTableData, ModuleMapKind},
        test::{MockDac, MockReader},
        typesystem::ClrType,
    };

    const MODULE: u64 = 0x100;
    const LIST: u64 = 0x9000;
    const POINT: u64 = 0xa000;

    fn factory() -> TypeFactory {
        let mut dac = MockDac::new();
        let common = CommonMethodTables {
            object: 0x1000,
            string: 0x2000,
            free: 0x3000,
            exception: 0,
            array: 0,
        };
        dac.common = Some(common);
        dac.add_method_table(0x1000, MethodTableData::default(), "System.Object");
        dac.add_method_table(
            LIST,
            MethodTableData {
                parent_method_table: 0x1000,
                ..Default::default()
            },
            "System.Collections.Generic.List`1",
        );
        dac.add_method_table(
            POINT,
            MethodTableData {
                parent_method_table: 0x1000,
                ..Default::default()
            },
            "Point",
        );
        dac.module_maps.insert(
            (MODULE, ModuleMapKind::TypeDefToMethodTable),
            vec![(0x0200_0001, LIST)],
        );
        dac.module_maps.insert(
            (MODULE, ModuleMapKind::TypeRefToMethodTable),
            vec![(0x0100_0002, POINT)],
        );

        TypeFactory::new(
            Arc::new(dac),
            Arc::new(MockReader::new(8)),
            CacheOptions::default(),
            common,
            0,
        )
    }

    fn decode(factory: &TypeFactory, blob: &[u8]) -> (Option<ClrTypeRc>, usize) {
        let params = [
            GenericParameter::new(0, Some("T".to_string())),
            GenericParameter::new(1, Some("U".to_string())),
        ];
        let mut parser = Parser::new(blob);
        let decoded = factory.get_or_create_type_from_signature(MODULE, &mut parser, &params, &[]);
        (decoded, parser.pos())
    }

    #[test]
    fn primitive() {
        let factory = factory();
        let (ty, pos) = decode(&factory, &[ELEMENT_TYPE::I4, 0xFF]);
        assert_eq!(ty.unwrap().element_type(), ClrElementType::Int32);
        assert_eq!(pos, 1);

        let (ty, _) = decode(&factory, &[ELEMENT_TYPE::OBJECT]);
        assert!(Arc::ptr_eq(&ty.unwrap(), factory.object_type()));
    }

    #[test]
    fn szarray() {
        let factory = factory();
        let (ty, pos) = decode(&factory, &[ELEMENT_TYPE::SZARRAY, ELEMENT_TYPE::I4]);
        let ty = ty.unwrap();
        assert_eq!(ty.name().as_deref(), Some("System.Int32[]"));
        assert_eq!(ty.element_type(), ClrElementType::SZArray);
        assert_eq!(pos, 2);
    }

    #[test]
    fn array_consumes_bounds() {
        let factory = factory();
        // int[3,4] with one lower bound of 0
        let blob = [
            ELEMENT_TYPE::ARRAY,
            ELEMENT_TYPE::I4,
            0x02,
            0x02,
            0x03,
            0x04,
            0x01,
            0x00,
            0xFF,
        ];
        let (ty, pos) = decode(&factory, &blob);
        assert_eq!(ty.unwrap().name().as_deref(), Some("System.Int32[,]"));
        assert_eq!(pos, 8);
    }

    #[test]
    fn class_and_valuetype_tokens() {
        let factory = factory();
        // TypeDef row 1 encodes as 0x04, TypeRef row 2 as 0x09
        let (ty, pos) = decode(&factory, &[ELEMENT_TYPE::CLASS, 0x04]);
        assert_eq!(ty.unwrap().method_table(), LIST);
        assert_eq!(pos, 2);

        let (ty, _) = decode(&factory, &[ELEMENT_TYPE::VALUETYPE, 0x09]);
        assert_eq!(ty.unwrap().method_table(), POINT);

        // Unresolvable class falls back to Object
        let (ty, pos) = decode(&factory, &[ELEMENT_TYPE::CLASS, 0x7C]);
        assert!(Arc::ptr_eq(&ty.unwrap(), factory.object_type()));
        assert_eq!(pos, 2);
    }

    #[test]
    fn generic_instantiation_skips_arguments() {
        let factory = factory();
        // List<int, string[]> followed by an unrelated byte
        let blob = [
            ELEMENT_TYPE::GENERICINST,
            ELEMENT_TYPE::CLASS,
            0x04,
            0x02,
            ELEMENT_TYPE::I4,
            ELEMENT_TYPE::SZARRAY,
            ELEMENT_TYPE::STRING,
            0xFF,
        ];
        let (ty, pos) = decode(&factory, &blob);
        assert_eq!(ty.unwrap().method_table(), LIST);
        assert_eq!(pos, 7);
    }

    #[test]
    fn generic_instantiation_unresolved_still_advances() {
        let factory = factory();
        let blob = [
            ELEMENT_TYPE::GENERICINST,
            ELEMENT_TYPE::VALUETYPE,
            0x7C,
            0x01,
            ELEMENT_TYPE::CLASS,
            0x09,
            0xFF,
        ];
        let (ty, pos) = decode(&factory, &blob);
        assert!(ty.is_none());
        assert_eq!(pos, 6);
    }

    #[test]
    fn generic_parameters() {
        let factory = factory();
        let (ty, pos) = decode(&factory, &[ELEMENT_TYPE::VAR, 0x01]);
        let ty = ty.unwrap();
        assert_eq!(ty.name().as_deref(), Some("U"));
        assert_eq!(ty.element_type(), ClrElementType::Var);
        assert_eq!(pos, 2);

        let (ty, pos) = decode(&factory, &[ELEMENT_TYPE::MVAR, 0x00]);
        assert!(ty.is_none());
        assert_eq!(pos, 2);
    }

    #[test]
    fn pointers_wrap_inner_or_void() {
        let factory = factory();
        let (ty, pos) = decode(&factory, &[ELEMENT_TYPE::PTR, ELEMENT_TYPE::I4]);
        assert_eq!(ty.unwrap().name().as_deref(), Some("System.Int32*"));
        assert_eq!(pos, 2);

        let (ty, pos) = decode(&factory, &[ELEMENT_TYPE::BYREF, 0x17]);
        let ty = ty.unwrap();
        assert!(ty.is_pointer());
        assert_eq!(ty.name().as_deref(), Some("System.Void*"));
        assert_eq!(pos, 2);
    }

    #[test]
    fn function_pointer_consumes_method_signature() {
        let factory = factory();
        // void (*)(int), default calling convention
        let blob = [
            ELEMENT_TYPE::FNPTR,
            0x00,
            0x01,
            ELEMENT_TYPE::VOID,
            ELEMENT_TYPE::I4,
            0xFF,
        ];
        let (ty, pos) = decode(&factory, &blob);
        assert!(ty.unwrap().is_pointer());
        assert_eq!(pos, 5);
    }

    #[test]
    fn custom_modifiers_are_skipped() {
        let factory = factory();
        let (ty, pos) = decode(&factory, &[ELEMENT_TYPE::CMOD_OPT, 0x09, ELEMENT_TYPE::I4]);
        assert_eq!(ty.unwrap().element_type(), ClrElementType::Int32);
        assert_eq!(pos, 3);

        let blob = [
            ELEMENT_TYPE::SZARRAY,
            ELEMENT_TYPE::CMOD_REQD,
            0x09,
            ELEMENT_TYPE::U1,
        ];
        let (ty, pos) = decode(&factory, &blob);
        assert_eq!(ty.unwrap().name().as_deref(), Some("System.Byte[]"));
        assert_eq!(pos, 4);
    }

    #[test]
    fn reserved_token_tag_is_consumed() {
        let factory = factory();
        let (ty, pos) = decode(&factory, &[ELEMENT_TYPE::GENERICINST, ELEMENT_TYPE::CLASS, 0x03, 0x00]);
        assert!(ty.is_none());
        assert_eq!(pos, 4);
    }

    #[test]
    fn invalid_token_lead_byte_is_an_error() {
        let factory = factory();
        let (ty, pos) = decode(&factory, &[ELEMENT_TYPE::CLASS, 0xFF, ELEMENT_TYPE::I4]);
        assert!(ty.is_none());
        assert_eq!(pos, 1);

        // a pointer to it is not silently read as void*
        let (ty, _) = decode(&factory, &[ELEMENT_TYPE::PTR, ELEMENT_TYPE::CLASS, 0xFF]);
        assert!(ty.is_none());

        let mut parser = Parser::new(&[0xFF]);
        assert!(read_token(&mut parser).is_err());
        let mut parser = Parser::new(&[0x03]);
        assert_eq!(read_token(&mut parser).unwrap(), None);
        assert_eq!(parser.pos(), 1);
    }

    #[test]
    fn truncated_blob() {
        let factory = factory();
        assert!(decode(&factory, &[ELEMENT_TYPE::SZARRAY]).0.is_none());
        assert!(decode(&factory, &[]).0.is_none());
        assert!(decode(&factory, &[ELEMENT_TYPE::ARRAY, ELEMENT_TYPE::I4, 0x02]).0.is_none());
    }

    #[test]
    fn recursion_limit() {
        let factory = factory();
        let mut blob = vec![ELEMENT_TYPE::SZARRAY; MAX_RECURSION_DEPTH + 10];
        blob.push(ELEMENT_TYPE::I4);
        assert!(decode(&factory, &blob).0.is_none());

        let mut shallow = vec![ELEMENT_TYPE::SZARRAY; 3];
        shallow.push(ELEMENT_TYPE::I4);
        let (ty, pos) = decode(&factory, &shallow);
        assert!(matches!(*ty.unwrap(), ClrType::Constructed(_)));
        assert_eq!(pos, 4);
    }
}
